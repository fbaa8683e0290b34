//! Capture source wiring
//!
//! A source is connected once to an input slot when the engine is
//! initialized. Until the stream's encoder is attached the slot keeps the
//! first buffer (or frame) so its format can be read; everything after it
//! is refused. Once attached, data goes straight into the encoder queue.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::media::{AudioFormat, RawAudioBuffer, RawVideoFrame, VideoFrameFormat};

use super::audio::AudioEncoderInput;
use super::video::VideoEncoderInput;
use super::RecorderEvent;

/// A producer of raw audio buffers
pub trait AudioSource: Send {
    fn name(&self) -> String;

    /// Current format, `None` until the source has delivered data
    fn format(&self) -> Option<AudioFormat>;

    /// Starts delivering buffers to `input`
    fn connect(&mut self, input: AudioInput);

    fn disconnect(&mut self);
}

/// A producer of raw video frames
pub trait VideoSource: Send {
    fn name(&self) -> String;

    /// Current format, `None` until the source has delivered a frame
    fn format(&self) -> Option<VideoFrameFormat>;

    /// Starts delivering frames to `input`
    fn connect(&mut self, input: VideoInput);

    fn disconnect(&mut self);
}

/// Queue side of an encoder as seen from an input slot
pub(crate) trait EncoderQueue<T>: Clone + Send {
    fn push(&self, item: T) -> bool;
    fn can_push(&self) -> bool;
}

/// Counts sources that reported end of stream and emits `AutoStopped`
/// once all did while auto stop is enabled
#[derive(Debug)]
pub(crate) struct EndOfStreamTracker {
    state: Mutex<TrackerState>,
    events: Sender<RecorderEvent>,
}

#[derive(Debug, Default)]
struct TrackerState {
    sources: usize,
    finished: usize,
    auto_stop: bool,
    emitted: bool,
}

impl EndOfStreamTracker {
    pub(crate) fn new(events: Sender<RecorderEvent>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    pub(crate) fn add_source(&self) {
        self.state.lock().sources += 1;
    }

    pub(crate) fn set_auto_stop(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_stop = enabled;
        self.check(&mut state);
    }

    fn source_finished(&self) {
        let mut state = self.state.lock();
        state.finished += 1;
        self.check(&mut state);
    }

    fn check(&self, state: &mut TrackerState) {
        if state.auto_stop && !state.emitted && state.sources > 0 && state.finished >= state.sources {
            state.emitted = true;
            log::info!("[RecordingEngine] All sources finished, auto stopping");
            let _ = self.events.send(RecorderEvent::AutoStopped);
        }
    }
}

struct SlotState<T, E> {
    connected: bool,
    first: Option<T>,
    encoder: Option<E>,
    end_of_stream: bool,
}

struct Slot<T, E> {
    name: String,
    state: Mutex<SlotState<T, E>>,
    arrived: Sender<()>,
    tracker: Arc<EndOfStreamTracker>,
}

impl<T, E: EncoderQueue<T>> Slot<T, E> {
    fn new(name: String, tracker: Arc<EndOfStreamTracker>) -> (Self, Receiver<()>) {
        let (arrived, first_rx) = crossbeam_channel::bounded(1);
        tracker.add_source();
        let slot = Self {
            name,
            state: Mutex::new(SlotState {
                connected: true,
                first: None,
                encoder: None,
                end_of_stream: false,
            }),
            arrived,
            tracker,
        };
        (slot, first_rx)
    }

    fn push(&self, item: T, valid: bool) -> bool {
        // The encoder queue has its own lock; release the slot first
        let encoder = {
            let mut state = self.state.lock();
            if !state.connected {
                return false;
            }
            match &state.encoder {
                Some(encoder) => encoder.clone(),
                None => {
                    if state.first.is_some() || !valid {
                        return false;
                    }
                    state.first = Some(item);
                    let _ = self.arrived.try_send(());
                    return true;
                }
            }
        };
        encoder.push(item)
    }

    fn can_push(&self) -> bool {
        let encoder = {
            let state = self.state.lock();
            if !state.connected {
                return false;
            }
            match &state.encoder {
                Some(encoder) => encoder.clone(),
                None => return state.first.is_none(),
            }
        };
        encoder.can_push()
    }

    fn end_of_stream(&self) {
        let mut state = self.state.lock();
        if state.end_of_stream {
            return;
        }
        state.end_of_stream = true;
        drop(state);
        log::debug!("[RecordingEngine] End of stream from {}", self.name);
        self.tracker.source_finished();
    }

    fn take_first(&self) -> Option<T> {
        self.state.lock().first.take()
    }

    fn has_first(&self) -> bool {
        self.state.lock().first.is_some()
    }

    fn attach(&self, encoder: E) {
        self.state.lock().encoder = Some(encoder);
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.encoder = None;
        state.first = None;
    }
}

/// Input slot of one audio stream
#[derive(Clone)]
pub struct AudioInput {
    slot: Arc<Slot<RawAudioBuffer, AudioEncoderInput>>,
}

impl AudioInput {
    pub(crate) fn new(name: String, tracker: Arc<EndOfStreamTracker>) -> (Self, Receiver<()>) {
        let (slot, first_rx) = Slot::new(name, tracker);
        (Self { slot: Arc::new(slot) }, first_rx)
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Hands a buffer to the stream. Returns false when it was dropped.
    pub fn add_buffer(&self, buffer: RawAudioBuffer) -> bool {
        let valid = buffer.is_valid();
        self.slot.push(buffer, valid)
    }

    /// Whether the encoder wants more data right now
    pub fn can_push(&self) -> bool {
        self.slot.can_push()
    }

    pub fn end_of_stream(&self) {
        self.slot.end_of_stream();
    }

    pub(crate) fn take_first(&self) -> Option<RawAudioBuffer> {
        self.slot.take_first()
    }

    pub(crate) fn has_first(&self) -> bool {
        self.slot.has_first()
    }

    pub(crate) fn attach(&self, encoder: AudioEncoderInput) {
        self.slot.attach(encoder);
    }

    pub(crate) fn detach(&self) {
        self.slot.detach();
    }
}

/// Input slot of one video stream
#[derive(Clone)]
pub struct VideoInput {
    slot: Arc<Slot<RawVideoFrame, VideoEncoderInput>>,
}

impl VideoInput {
    pub(crate) fn new(name: String, tracker: Arc<EndOfStreamTracker>) -> (Self, Receiver<()>) {
        let (slot, first_rx) = Slot::new(name, tracker);
        (Self { slot: Arc::new(slot) }, first_rx)
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Hands a frame to the stream. Returns false when it was dropped.
    pub fn add_frame(&self, frame: RawVideoFrame) -> bool {
        let valid = frame.is_valid();
        self.slot.push(frame, valid)
    }

    pub fn can_push(&self) -> bool {
        self.slot.can_push()
    }

    pub fn end_of_stream(&self) {
        self.slot.end_of_stream();
    }

    pub(crate) fn take_first(&self) -> Option<RawVideoFrame> {
        self.slot.take_first()
    }

    pub(crate) fn has_first(&self) -> bool {
        self.slot.has_first()
    }

    pub(crate) fn attach(&self, encoder: VideoEncoderInput) {
        self.slot.attach(encoder);
    }

    pub(crate) fn detach(&self) {
        self.slot.detach();
    }
}

// ─── Push sources ───────────────────────────────────────────────────────────

/// An audio source fed by the caller. Clones share the connection, so one
/// clone can be handed to the engine and another kept for pushing.
#[derive(Clone)]
pub struct PushAudioSource {
    name: String,
    format: Option<AudioFormat>,
    input: Arc<Mutex<Option<AudioInput>>>,
}

impl PushAudioSource {
    pub fn new(name: impl Into<String>, format: Option<AudioFormat>) -> Self {
        Self {
            name: name.into(),
            format,
            input: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns false when the buffer was dropped or nothing is connected
    pub fn push(&self, buffer: RawAudioBuffer) -> bool {
        match self.input.lock().as_ref() {
            Some(input) => input.add_buffer(buffer),
            None => false,
        }
    }

    pub fn can_push(&self) -> bool {
        self.input.lock().as_ref().is_some_and(AudioInput::can_push)
    }

    pub fn finish(&self) {
        if let Some(input) = self.input.lock().as_ref() {
            input.end_of_stream();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.input.lock().is_some()
    }
}

impl AudioSource for PushAudioSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn connect(&mut self, input: AudioInput) {
        *self.input.lock() = Some(input);
    }

    fn disconnect(&mut self) {
        *self.input.lock() = None;
    }
}

/// A video source fed by the caller; see [`PushAudioSource`]
#[derive(Clone)]
pub struct PushVideoSource {
    name: String,
    format: Option<VideoFrameFormat>,
    input: Arc<Mutex<Option<VideoInput>>>,
}

impl PushVideoSource {
    pub fn new(name: impl Into<String>, format: Option<VideoFrameFormat>) -> Self {
        Self {
            name: name.into(),
            format,
            input: Arc::new(Mutex::new(None)),
        }
    }

    pub fn push(&self, frame: RawVideoFrame) -> bool {
        match self.input.lock().as_ref() {
            Some(input) => input.add_frame(frame),
            None => false,
        }
    }

    pub fn can_push(&self) -> bool {
        self.input.lock().as_ref().is_some_and(VideoInput::can_push)
    }

    pub fn finish(&self) {
        if let Some(input) = self.input.lock().as_ref() {
            input.end_of_stream();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.input.lock().is_some()
    }
}

impl VideoSource for PushVideoSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn format(&self) -> Option<VideoFrameFormat> {
        self.format
    }

    fn connect(&mut self, input: VideoInput) {
        *self.input.lock() = Some(input);
    }

    fn disconnect(&mut self) {
        *self.input.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ChannelLayout, SampleFormat};

    fn buffer() -> RawAudioBuffer {
        let format = AudioFormat::new(SampleFormat::S16, 48000, ChannelLayout::MONO);
        RawAudioBuffer::new(vec![0; 960], format, 0)
    }

    #[test]
    fn slot_keeps_only_the_first_buffer_before_attach() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let tracker = Arc::new(EndOfStreamTracker::new(tx));
        let (input, first_rx) = AudioInput::new("mic".into(), tracker);

        assert!(input.can_push());
        assert!(input.add_buffer(buffer()));
        assert!(first_rx.try_recv().is_ok());
        assert!(!input.can_push());
        assert!(!input.add_buffer(buffer()));

        assert!(input.take_first().is_some());
        input.detach();
        assert!(!input.add_buffer(buffer()));
    }

    #[test]
    fn auto_stop_fires_once_every_source_finished() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tracker = Arc::new(EndOfStreamTracker::new(tx));
        let (a, _) = AudioInput::new("a".into(), tracker.clone());
        let (b, _) = VideoInput::new("b".into(), tracker.clone());

        a.end_of_stream();
        a.end_of_stream();
        b.end_of_stream();
        assert!(rx.try_recv().is_err());

        tracker.set_auto_stop(true);
        assert_eq!(rx.try_recv(), Ok(RecorderEvent::AutoStopped));
        tracker.set_auto_stop(true);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_source_without_connection_drops() {
        let source = PushAudioSource::new("tone", None);
        assert!(!source.is_connected());
        assert!(!source.push(buffer()));
        assert!(!source.can_push());
    }
}
