//! Recording engine: owns the container, the encoder threads and the muxer
//! thread, and drives them through one recording session.
//!
//! ```text
//! None -> FormatsInitialization -> EncodersInitialization -> Encoding
//!      -> Finalization -> Finalized        (Failed when start() fails)
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::{EncoderSettings, RecorderConfig};
use crate::container::{ContainerWriter, StreamParams};
use crate::convert::FrameLayout;
use crate::encoding::CodecRegistry;

use super::audio::AudioEncoder;
use super::muxer::{Muxer, MuxerMessage};
use super::source::{AudioInput, AudioSource, EndOfStreamTracker, VideoInput, VideoSource};
use super::timeline::RecordingTimeline;
use super::video::{infer_frame_rate, VideoEncoder, VideoEncoderLimits, VideoSourceParams};
use super::{EncoderError, RecorderErrorKind, RecorderEvent, RecordingError, Result};

const NO_VALID_STREAM: &str = "No valid stream found for encoding";
const CANNOT_START_WRITING: &str = "Cannot start writing the stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    None,
    FormatsInitialization,
    EncodersInitialization,
    Encoding,
    Finalization,
    Finalized,
    Failed,
}

struct AudioStream {
    source: Box<dyn AudioSource>,
    input: AudioInput,
}

struct VideoStream {
    source: Box<dyn VideoSource>,
    input: VideoInput,
}

/// Either kind of encoder thread, while streams are being set up
enum PendingEncoder {
    Audio(AudioEncoder),
    Video(VideoEncoder),
}

impl PendingEncoder {
    fn name(&self) -> &str {
        match self {
            PendingEncoder::Audio(encoder) => encoder.name(),
            PendingEncoder::Video(encoder) => encoder.name(),
        }
    }

    fn wait_initialized(&self) -> std::result::Result<StreamParams, EncoderError> {
        match self {
            PendingEncoder::Audio(encoder) => encoder.wait_initialized(),
            PendingEncoder::Video(encoder) => encoder.wait_initialized(),
        }
    }

    fn start(&mut self, stream_index: usize, packets: Sender<MuxerMessage>) {
        match self {
            PendingEncoder::Audio(encoder) => encoder.start(stream_index, packets),
            PendingEncoder::Video(encoder) => encoder.start(stream_index, packets),
        }
    }

    fn set_paused(&self, paused: bool) {
        match self {
            PendingEncoder::Audio(encoder) => encoder.set_paused(paused),
            PendingEncoder::Video(encoder) => encoder.set_paused(paused),
        }
    }

    fn finish(self) {
        match self {
            PendingEncoder::Audio(encoder) => encoder.finish(),
            PendingEncoder::Video(encoder) => encoder.finish(),
        }
    }
}

pub struct RecordingEngine {
    settings: EncoderSettings,
    config: RecorderConfig,
    registry: Arc<CodecRegistry>,
    container: Option<Box<dyn ContainerWriter>>,
    events: Sender<RecorderEvent>,
    timeline: Arc<RecordingTimeline>,
    tracker: Arc<EndOfStreamTracker>,
    state: EngineState,
    audio_streams: Vec<AudioStream>,
    video_streams: Vec<VideoStream>,
    formats_initializer: Option<JoinHandle<()>>,
    cancel_formats: Option<Sender<()>>,
    encoders: Vec<PendingEncoder>,
    muxer: Option<Muxer>,
}

impl RecordingEngine {
    /// Creates an engine writing into `container`, plus the receiver of its
    /// events
    pub fn new(
        settings: EncoderSettings,
        config: &RecorderConfig,
        container: Box<dyn ContainerWriter>,
        registry: Arc<CodecRegistry>,
    ) -> (Self, Receiver<RecorderEvent>) {
        let (events, receiver) = unbounded();
        let engine = Self {
            settings,
            config: config.clone(),
            registry,
            container: Some(container),
            timeline: Arc::new(RecordingTimeline::new(events.clone())),
            tracker: Arc::new(EndOfStreamTracker::new(events.clone())),
            events,
            state: EngineState::None,
            audio_streams: Vec::new(),
            video_streams: Vec::new(),
            formats_initializer: None,
            cancel_formats: None,
            encoders: Vec::new(),
            muxer: None,
        };
        (engine, receiver)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Largest timestamp encoded so far, in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.timeline.duration_ms()
    }

    /// Connects the sources and starts waiting for the formats of those that
    /// only know theirs once data arrives
    pub fn initialize(
        &mut self,
        audio_sources: Vec<Box<dyn AudioSource>>,
        video_sources: Vec<Box<dyn VideoSource>>,
    ) -> Result<()> {
        if self.state != EngineState::None {
            return Err(RecordingError::InvalidState(self.state));
        }

        let mut pending = Vec::new();

        for mut source in audio_sources {
            let (input, arrived) = AudioInput::new(source.name(), self.tracker.clone());
            source.connect(input.clone());
            if source.format().is_none() {
                pending.push((source.name(), arrived));
            }
            self.audio_streams.push(AudioStream { source, input });
        }

        for mut source in video_sources {
            let (input, arrived) = VideoInput::new(source.name(), self.tracker.clone());
            source.connect(input.clone());
            if source.format().is_none() {
                pending.push((source.name(), arrived));
            }
            self.video_streams.push(VideoStream { source, input });
        }

        log::info!(
            "[RecordingEngine] Initializing {} audio and {} video sources ({} awaiting format)",
            self.audio_streams.len(),
            self.video_streams.len(),
            pending.len()
        );

        if !pending.is_empty() {
            let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
            let timeout = Duration::from_millis(self.config.format_wait_timeout_ms);
            let handle = std::thread::Builder::new()
                .name("mediarec-formats".into())
                .spawn(move || wait_for_formats(pending, cancelled, timeout))
                .map_err(|e| RecordingError::Session {
                    kind: RecorderErrorKind::ResourceError,
                    message: format!("Failed to spawn formats initializer: {}", e),
                })?;
            self.formats_initializer = Some(handle);
            self.cancel_formats = Some(cancel);
        }

        self.state = EngineState::FormatsInitialization;
        Ok(())
    }

    /// Builds the encoders, writes the header and starts encoding
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, EngineState::None | EngineState::FormatsInitialization) {
            return Err(RecordingError::InvalidState(self.state));
        }
        self.state = EngineState::EncodersInitialization;
        self.join_formats_initializer(false);

        self.create_audio_encoders();
        self.create_video_encoders();

        if self.encoders.is_empty() {
            return Err(self.fail(RecorderErrorKind::ResourceError, NO_VALID_STREAM));
        }

        let mut initialized = Vec::new();
        for encoder in std::mem::take(&mut self.encoders) {
            match encoder.wait_initialized() {
                Ok(params) => initialized.push((encoder, params)),
                Err(e) => {
                    self.stream_error(
                        RecorderErrorKind::ResourceError,
                        format!("Could not initialize encoder for {}: {}", encoder.name(), e),
                    );
                    encoder.finish();
                }
            }
        }

        let Some(mut container) = self.container.take() else {
            return Err(RecordingError::InvalidState(self.state));
        };

        let mut registered = Vec::new();
        for (encoder, params) in initialized {
            match container.add_stream(params) {
                Ok(index) => registered.push((encoder, index)),
                Err(e) => {
                    self.stream_error(
                        RecorderErrorKind::FormatError,
                        format!("Cannot add stream for {}: {}", encoder.name(), e),
                    );
                    encoder.finish();
                }
            }
        }

        if registered.is_empty() {
            self.container = Some(container);
            return Err(self.fail(RecorderErrorKind::ResourceError, NO_VALID_STREAM));
        }

        if let Err(e) = container.write_header() {
            log::error!("[RecordingEngine] Header write failed: {}", e);
            self.container = Some(container);
            self.encoders = registered.into_iter().map(|(encoder, _)| encoder).collect();
            return Err(self.fail(RecorderErrorKind::ResourceError, CANNOT_START_WRITING));
        }

        let muxer = match Muxer::start(container) {
            Ok(muxer) => muxer,
            Err(e) => {
                self.encoders = registered.into_iter().map(|(encoder, _)| encoder).collect();
                return Err(self.fail(RecorderErrorKind::ResourceError, &e.to_string()));
            }
        };

        for (mut encoder, index) in registered {
            encoder.start(index, muxer.sender());
            self.encoders.push(encoder);
        }
        self.muxer = Some(muxer);
        self.state = EngineState::Encoding;

        log::info!("[RecordingEngine] Encoding {} streams", self.encoders.len());
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) {
        log::info!("[RecordingEngine] {}", if paused { "Paused" } else { "Resumed" });
        for encoder in &self.encoders {
            encoder.set_paused(paused);
        }
    }

    /// With auto stop enabled `AutoStopped` is emitted once every source
    /// reported end of stream
    pub fn set_auto_stop(&self, enabled: bool) {
        self.tracker.set_auto_stop(enabled);
    }

    /// Stops the sources, drains every encoder and the muxer, writes the
    /// trailer and closes the output. Always ends with `FinalizationDone`.
    pub fn finalize(&mut self) -> Result<()> {
        if matches!(self.state, EngineState::Finalization | EngineState::Finalized) {
            return Ok(());
        }
        let was_encoding = self.state == EngineState::Encoding;
        self.state = EngineState::Finalization;
        log::info!("[RecordingEngine] Finalizing");

        for stream in &mut self.audio_streams {
            stream.source.disconnect();
            stream.input.detach();
        }
        for stream in &mut self.video_streams {
            stream.source.disconnect();
            stream.input.detach();
        }
        self.join_formats_initializer(true);

        for encoder in self.encoders.drain(..) {
            encoder.finish();
        }

        if let Some(muxer) = self.muxer.take() {
            match muxer.finish() {
                Some(container) => self.container = Some(container),
                None => log::error!("[RecordingEngine] Lost the container"),
            }
        }

        let mut result = Ok(());
        if let Some(container) = self.container.as_mut() {
            if was_encoding {
                if let Err(e) = container.write_trailer() {
                    let message = format!("Cannot write trailer: {}", e);
                    log::error!("[RecordingEngine] {}", message);
                    let _ = self.events.send(RecorderEvent::SessionError {
                        kind: RecorderErrorKind::FormatError,
                        message: message.clone(),
                    });
                    result = Err(RecordingError::Session {
                        kind: RecorderErrorKind::FormatError,
                        message,
                    });
                }
            }
            if let Err(e) = container.close() {
                log::error!("[RecordingEngine] Failed to close output: {}", e);
            }
        }

        self.state = EngineState::Finalized;
        log::info!(
            "[RecordingEngine] Finalization done, duration {} ms",
            self.timeline.duration_ms()
        );
        let _ = self.events.send(RecorderEvent::FinalizationDone);
        result
    }

    fn create_audio_encoders(&mut self) {
        for index in 0..self.audio_streams.len() {
            let stream = &self.audio_streams[index];
            let name = stream.source.name();
            let first = stream.input.take_first();
            let format = stream
                .source
                .format()
                .or(first.as_ref().map(|buffer| buffer.format))
                .filter(|format| format.is_valid());

            let Some(format) = format else {
                self.audio_streams[index].input.detach();
                self.stream_error(
                    RecorderErrorKind::ResourceError,
                    format!("Audio source {} has no valid format", name),
                );
                continue;
            };

            let spawned = AudioEncoder::spawn(
                name.clone(),
                format,
                self.settings.clone(),
                self.registry.clone(),
                self.timeline.clone(),
                self.config.max_audio_queue_ms,
            );
            match spawned {
                Ok(encoder) => {
                    if let Some(buffer) = first {
                        encoder.input().add_buffer(buffer);
                    }
                    self.audio_streams[index].input.attach(encoder.input());
                    self.encoders.push(PendingEncoder::Audio(encoder));
                }
                Err(e) => {
                    self.audio_streams[index].input.detach();
                    self.stream_error(RecorderErrorKind::ResourceError, format!("{}: {}", name, e));
                }
            }
        }
    }

    fn create_video_encoders(&mut self) {
        let limits = VideoEncoderLimits {
            max_queue_frames: self.config.max_video_queue_frames,
            max_dts_repair_drops: self.config.max_dts_repair_drops,
        };

        for index in 0..self.video_streams.len() {
            let stream = &self.video_streams[index];
            let name = stream.source.name();
            let first = stream.input.take_first();
            let format = stream.source.format();

            if self.settings.video_codec.is_none() {
                self.video_streams[index].input.detach();
                self.stream_error(
                    RecorderErrorKind::ResourceError,
                    format!("No video codec configured for {}", name),
                );
                continue;
            }

            let layout = first.as_ref().map(FrameLayout::of).or_else(|| {
                format
                    .filter(|f| f.is_valid())
                    .map(|f| FrameLayout::software(f.pixel_format, f.size))
            });
            let Some(layout) = layout.filter(|l| !l.size.is_empty()) else {
                self.video_streams[index].input.detach();
                self.stream_error(
                    RecorderErrorKind::ResourceError,
                    format!("Video source {} has no valid format", name),
                );
                continue;
            };

            let source = VideoSourceParams {
                layout,
                frame_rate: infer_frame_rate(format.as_ref(), first.as_ref()),
            };
            let spawned = VideoEncoder::spawn(
                name.clone(),
                source,
                self.settings.clone(),
                self.registry.clone(),
                self.timeline.clone(),
                self.events.clone(),
                limits,
            );
            match spawned {
                Ok(encoder) => {
                    if let Some(frame) = first {
                        encoder.input().add_frame(frame);
                    }
                    self.video_streams[index].input.attach(encoder.input());
                    self.encoders.push(PendingEncoder::Video(encoder));
                }
                Err(e) => {
                    self.video_streams[index].input.detach();
                    self.stream_error(RecorderErrorKind::ResourceError, format!("{}: {}", name, e));
                }
            }
        }
    }

    fn join_formats_initializer(&mut self, cancel: bool) {
        if cancel {
            self.cancel_formats = None;
        }
        if let Some(handle) = self.formats_initializer.take() {
            if handle.join().is_err() {
                log::error!("[RecordingEngine] Formats initializer panicked");
            }
        }
        self.cancel_formats = None;
    }

    fn stream_error(&self, kind: RecorderErrorKind, message: String) {
        log::warn!("[RecordingEngine] Stream initialization error: {}", message);
        let _ = self
            .events
            .send(RecorderEvent::StreamInitializationError { kind, message });
    }

    /// Emits a session error and leaves the engine failed
    fn fail(&mut self, kind: RecorderErrorKind, message: &str) -> RecordingError {
        log::error!("[RecordingEngine] Session error: {}", message);
        self.state = EngineState::Failed;
        let _ = self.events.send(RecorderEvent::SessionError {
            kind,
            message: message.to_string(),
        });
        RecordingError::Session {
            kind,
            message: message.to_string(),
        }
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        if self.state != EngineState::Finalized {
            let _ = self.finalize();
        }
    }
}

/// Waits until every pending source delivered its first data, the timeout
/// expires or the engine gives up
fn wait_for_formats(pending: Vec<(String, Receiver<()>)>, cancelled: Receiver<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for (name, arrived) in pending {
        let remaining = deadline.saturating_duration_since(Instant::now());
        crossbeam_channel::select! {
            recv(arrived) -> _ => log::debug!("[RecordingEngine] Got format of {}", name),
            recv(cancelled) -> _ => return,
            default(remaining) => {
                log::warn!("[RecordingEngine] Timed out waiting for the format of {}", name);
                return;
            }
        }
    }
}
