//! GStreamer initialization and environment configuration
//!
//! A private GStreamer deployment can be shipped next to the executable (in
//! a `gstreamer/` folder) or pointed at with `MEDIAREC_GSTREAMER_DIR`. When
//! one is found, its binaries and plugins take precedence over the system
//! installation.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Once;

static GSTREAMER_INIT: Once = Once::new();

const PRIVATE_DIR_ENV: &str = "MEDIAREC_GSTREAMER_DIR";

/// Initialize the GStreamer environment. Safe to call any number of times;
/// only the first call does work.
pub fn init_gstreamer_env() {
    GSTREAMER_INIT.call_once(|| {
        if let Some(dir) = find_private_deployment() {
            if let Err(e) = use_private_deployment(&dir) {
                log::warn!("[GStreamer] Failed to set up private deployment: {}", e);
                log::info!("[GStreamer] Will attempt to use system installation");
            }
        }

        match gstreamer::init() {
            Ok(_) => {
                let (major, minor, micro, _) = gstreamer::version();
                log::info!("[GStreamer] Initialized, version {}.{}.{}", major, minor, micro);
            }
            Err(e) => {
                log::error!("[GStreamer] Failed to initialize: {}", e);
                log::error!("[GStreamer] Only built-in encoders will be available");
            }
        }
    });
}

fn find_private_deployment() -> Option<PathBuf> {
    if let Ok(dir) = env::var(PRIVATE_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?.join("gstreamer");
    dir.exists().then_some(dir)
}

fn use_private_deployment(dir: &Path) -> Result<(), String> {
    let bin_dir = dir.join("bin");
    if !bin_dir.exists() {
        return Err(format!("no bin directory under {:?}", dir));
    }
    log::info!("[GStreamer] Using private deployment at {:?}", dir);

    let separator = if cfg!(windows) { ";" } else { ":" };
    let path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{}{}{}", bin_dir.display(), separator, path));

    let plugin_dir = dir.join("lib").join("gstreamer-1.0");
    if plugin_dir.exists() {
        env::set_var("GST_PLUGIN_PATH", &plugin_dir);
        log::debug!("[GStreamer] GST_PLUGIN_PATH={}", plugin_dir.display());
    }

    // Keep the plugin registry of the private deployment apart from the system one
    if let Some(data_dir) = dirs::data_local_dir() {
        let registry = data_dir.join("mediarec").join("gst-registry.bin");
        if let Some(parent) = registry.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        env::set_var("GST_REGISTRY", &registry);
    }

    Ok(())
}

/// Check if GStreamer is available and properly configured
pub fn is_gstreamer_available() -> bool {
    gstreamer::init().is_ok()
}
