// mediarec - recording pipeline library
// Encodes live audio buffers and video frames into a muxed container file

pub mod config;
pub mod container;
pub mod convert;
pub mod encoding;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_init;
pub mod media;
pub mod negotiation;
pub mod recording;

use std::sync::Once;

static LOGGING_INIT: Once = Once::new();

/// Sets up `env_logger` (`RUST_LOG`, default level `info`). Later calls
/// do nothing, and an already installed logger is left alone.
pub fn init_logging() {
    LOGGING_INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .try_init();
    });
}
