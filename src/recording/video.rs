//! Video encoder thread
//!
//! Frames go through a bounded queue; when the encoder falls behind new
//! frames are dropped instead of buffering without limit. Presentation times
//! come from the capture timestamps, shifted by a base time that grows by
//! every paused interval.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::EncoderSettings;
use crate::container::StreamParams;
use crate::convert::{FrameLayout, VideoConverter};
use crate::encoding::codec::{
    CodecRegistry, EncoderVideoFrame, VideoEncoderConfig, VideoEncoderContext, VideoEncoderFactory,
};
use crate::encoding::{CodecError, VideoCodec};
use crate::media::{CompressedPacket, HwAccel, PixelFormat, RawVideoFrame, Rational, Size, VideoFrameFormat};
use crate::negotiation::{
    negotiate_video, rank_by_score, sw_format_encoder_score, VideoNegotiation, DEFAULT_FRAME_RATE,
};

use super::muxer::{MuxerMessage, StreamStart};
use super::source::EncoderQueue;
use super::timeline::RecordingTimeline;
use super::{EncoderError, EncoderMessage, RecorderErrorKind, RecorderEvent};

/// Source frame rate: the format's nominal rate, else the first frame's
/// rate or duration, else 30 fps
pub fn infer_frame_rate(format: Option<&VideoFrameFormat>, first_frame: Option<&RawVideoFrame>) -> f64 {
    let from_format = format.and_then(|f| f.frame_rate).filter(|r| *r > 0.0);
    let from_frame = first_frame.and_then(|frame| {
        frame.frame_rate.filter(|r| *r > 0.0).or_else(|| match (frame.start_time, frame.end_time) {
            (Some(start), Some(end)) if end > start => Some(1_000_000.0 / (end - start) as f64),
            _ => None,
        })
    });
    from_format.or(from_frame).unwrap_or(DEFAULT_FRAME_RATE)
}

// ─── DTS repair ─────────────────────────────────────────────────────────────

/// What to do with a packet after its dts was checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtsVerdict {
    Keep,
    Drop,
    /// Too many packets dropped in a row; the stream cannot continue
    Fatal,
}

/// Keeps dts non-decreasing and never above pts for codecs that get it
/// wrong. Each time pts falls below dts the difference is added to a running
/// offset that is subtracted from every later dts.
#[derive(Debug, Clone)]
pub struct DtsRepair {
    offset: i64,
    prev_dts: Option<i64>,
    consecutive_drops: u32,
    max_drops: u32,
}

impl DtsRepair {
    pub fn new(max_drops: u32) -> Self {
        Self {
            offset: 0,
            prev_dts: None,
            consecutive_drops: 0,
            max_drops,
        }
    }

    pub fn fix(&mut self, packet: &mut CompressedPacket) -> DtsVerdict {
        let Some(mut dts) = packet.dts else {
            return DtsVerdict::Keep;
        };

        dts -= self.offset;
        if let Some(pts) = packet.pts {
            if pts < dts {
                self.offset += dts - pts;
                dts = pts;
            }
        }
        packet.dts = Some(dts);

        if let Some(prev) = self.prev_dts {
            if dts < prev {
                self.consecutive_drops += 1;
                log::warn!(
                    "[VideoEncoder] Skip packet; failed to fix dts: {} < {}",
                    dts,
                    prev
                );
                return if self.consecutive_drops > self.max_drops {
                    DtsVerdict::Fatal
                } else {
                    DtsVerdict::Drop
                };
            }
        }

        self.consecutive_drops = 0;
        self.prev_dts = Some(dts);
        DtsVerdict::Keep
    }
}

// ─── Frame encoder ──────────────────────────────────────────────────────────

/// What the engine knows about a video source when the encoder is built
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSourceParams {
    pub layout: FrameLayout,
    pub frame_rate: f64,
}

/// An opened video codec together with the conversion feeding it and the
/// packet timestamp bookkeeping
pub struct VideoFrameEncoder {
    encoder_name: String,
    codec: VideoCodec,
    context: VideoEncoderContext,
    converter: VideoConverter,
    negotiated: VideoNegotiation,
    /// One frame interval in the stream time base
    frame_duration: i64,
    last_packet_pts: Option<i64>,
    dts_repair: DtsRepair,
}

impl VideoFrameEncoder {
    /// Picks and opens an encoder: hardware encoders first, in device
    /// order, then software encoders ranked by how well they take the
    /// source's pixel format.
    pub fn create(
        settings: &EncoderSettings,
        source: &VideoSourceParams,
        registry: &CodecRegistry,
        max_dts_repair_drops: u32,
    ) -> Result<Self, EncoderError> {
        let codec = settings
            .video_codec
            .ok_or_else(|| EncoderError::NoEncoder("no video codec configured".into()))?;
        if source.layout.size.is_empty() {
            return Err(EncoderError::InvalidSource(format!(
                "{} {}",
                source.layout.format, source.layout.size
            )));
        }

        let requested_size = settings
            .video_resolution
            .filter(|s| !s.is_empty())
            .unwrap_or(source.layout.size);
        let requested_rate = settings
            .video_frame_rate
            .filter(|r| *r > 0.0)
            .unwrap_or(source.frame_rate);

        let mut last_error: Option<EncoderError> = None;

        if settings.hardware_acceleration {
            for &device in registry.hw_devices() {
                let candidates = registry
                    .video_encoders(codec)
                    .filter(|f| f.descriptor().hw_device() == Some(device));
                for factory in candidates {
                    let descriptor = factory.descriptor();
                    if !descriptor.supports_size(requested_size) {
                        log::debug!(
                            "[VideoEncoder] {} cannot encode {}",
                            descriptor.name,
                            requested_size
                        );
                        continue;
                    }
                    let accel = match HwAccel::create(device, registry.hw_devices()) {
                        Ok(accel) => accel,
                        Err(e) => {
                            log::warn!("[VideoEncoder] {}: {}", descriptor.name, e);
                            last_error = Some(e.into());
                            continue;
                        }
                    };
                    match Self::open_with(
                        factory.as_ref(),
                        codec,
                        settings,
                        source,
                        requested_size,
                        requested_rate,
                        Some(accel),
                        max_dts_repair_drops,
                    ) {
                        Ok(encoder) => return Ok(encoder),
                        Err(e) => {
                            log::warn!("[VideoEncoder] Failed to open {}: {}", descriptor.name, e);
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        let source_sw = if source.layout.sw_format.is_compressed() {
            PixelFormat::Rgb24
        } else {
            source.layout.sw_format
        };
        let software = rank_by_score(
            registry
                .video_encoders(codec)
                .filter(|f| !f.descriptor().is_hardware()),
            |factory| sw_format_encoder_score(factory.descriptor(), source_sw),
        );

        for (factory, _) in software {
            match Self::open_with(
                factory.as_ref(),
                codec,
                settings,
                source,
                requested_size,
                requested_rate,
                None,
                max_dts_repair_drops,
            ) {
                Ok(encoder) => return Ok(encoder),
                Err(e) => {
                    log::warn!("[VideoEncoder] Failed to open {}: {}", factory.descriptor().name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EncoderError::NoEncoder(format!("no {} encoder available", codec.display_name()))
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_with(
        factory: &dyn VideoEncoderFactory,
        codec: VideoCodec,
        settings: &EncoderSettings,
        source: &VideoSourceParams,
        requested_size: Size,
        requested_rate: f64,
        accel: Option<HwAccel>,
        max_dts_repair_drops: u32,
    ) -> Result<Self, EncoderError> {
        let descriptor = factory.descriptor();
        let negotiated = negotiate_video(
            descriptor,
            source.layout.format,
            source.layout.sw_format,
            requested_size,
            requested_rate,
            accel.as_ref(),
        )?;

        // Only a hardware target keeps the device
        let accel = accel.filter(|_| negotiated.target_format.is_hw());
        if let Some(accel) = &accel {
            accel.create_frames_context(negotiated.target_sw_format, negotiated.size)?;
        }

        let config = VideoEncoderConfig {
            pixel_format: negotiated.target_format,
            sw_format: negotiated.target_sw_format,
            size: negotiated.size,
            frame_rate: negotiated.frame_rate,
            time_base: negotiated.time_base,
            options: descriptor.family.apply_video(
                settings,
                codec,
                negotiated.size,
                negotiated.frame_rate.as_f64(),
            ),
            hw_accel: accel.clone(),
        };
        let context = factory.open(&config)?;

        let target = FrameLayout::new(negotiated.target_format, negotiated.target_sw_format, negotiated.size);
        let converter = VideoConverter::new(source.layout, target, accel)?;

        log::info!(
            "[VideoEncoder] Opened {}: {} {} @ {} fps -> {}({}) {} time base {}",
            descriptor.name,
            source.layout.format,
            source.layout.size,
            source.frame_rate,
            negotiated.target_format,
            negotiated.target_sw_format,
            negotiated.size,
            negotiated.time_base
        );

        Ok(Self {
            encoder_name: descriptor.name.clone(),
            codec,
            context,
            converter,
            frame_duration: Rational::rescale(1, negotiated.frame_rate.inverse(), negotiated.time_base),
            negotiated,
            last_packet_pts: None,
            dts_repair: DtsRepair::new(max_dts_repair_drops),
        })
    }

    pub fn encoder_name(&self) -> &str {
        &self.encoder_name
    }

    pub fn negotiated(&self) -> &VideoNegotiation {
        &self.negotiated
    }

    pub fn time_base(&self) -> Rational {
        self.negotiated.time_base
    }

    /// `us` microseconds in the stream time base, rounded to nearest
    pub fn pts_for(&self, us: i64) -> i64 {
        Rational::rescale(us, Rational::MICROS, self.negotiated.time_base)
    }

    pub fn stream_params(&self) -> StreamParams {
        let negotiated = &self.negotiated;
        let params = StreamParams::video(
            self.codec,
            negotiated.size,
            Some(negotiated.frame_rate),
            negotiated.time_base,
        )
        .with_codec_private(self.context.extradata());
        if self.codec == VideoCodec::RawVideo {
            params.with_pixel_format(negotiated.target_sw_format)
        } else {
            params
        }
    }

    /// Converts a frame and submits it with the given pts
    pub fn send_frame(&mut self, frame: RawVideoFrame, pts: i64) -> Result<(), EncoderError> {
        let layout = FrameLayout::of(&frame);
        let source = self.converter.source();
        // Compressed stills only know their real size once decoded
        let changed = if layout.format.is_compressed() {
            layout.format != source.format
        } else {
            layout != source
        };
        if changed {
            self.converter.update_source(layout)?;
        }

        let converted = self.converter.convert(frame)?;
        self.context.send_frame(Some(EncoderVideoFrame { frame: converted, pts }))?;
        Ok(())
    }

    /// Starts draining; `Again` means packets must be retrieved first
    pub fn send_end_of_stream(&mut self) -> Result<(), CodecError> {
        self.context.send_frame(None)
    }

    /// Next packet with its duration filled in and its dts repaired.
    /// `Ok(None)` when the codec has nothing more for now.
    pub fn retrieve_packet(&mut self) -> Result<Option<CompressedPacket>, EncoderError> {
        loop {
            let mut packet = match self.context.receive_packet() {
                Ok(packet) => packet,
                Err(CodecError::Again) | Err(CodecError::Eof) => return Ok(None),
                Err(e) => {
                    log::debug!("[VideoEncoder] Error receiving packet: {}", e);
                    return Ok(None);
                }
            };

            log::trace!(
                "[VideoEncoder] Got a packet pts {:?} dts {:?} ({:?} ms)",
                packet.pts,
                packet.dts,
                packet.pts_ms()
            );

            if packet.duration == 0 {
                packet.duration = match (self.last_packet_pts, packet.pts) {
                    (Some(prev), Some(pts)) => (pts - prev).max(0),
                    _ => self.frame_duration,
                };
            }
            if packet.pts.is_some() {
                self.last_packet_pts = packet.pts;
            }

            match self.dts_repair.fix(&mut packet) {
                DtsVerdict::Keep => return Ok(Some(packet)),
                DtsVerdict::Drop => continue,
                DtsVerdict::Fatal => {
                    return Err(EncoderError::Codec(CodecError::Backend(format!(
                        "{} produced more than {} packets with unrepairable dts",
                        self.encoder_name, self.dts_repair.max_drops
                    ))))
                }
            }
        }
    }
}

// ─── Encoder thread ─────────────────────────────────────────────────────────

pub(crate) struct QueuedFrame {
    frame: RawVideoFrame,
    adjust_time_base: bool,
}

#[derive(Debug)]
struct VideoQueueState {
    paused: bool,
    encoding_started: bool,
    adjust_time_base_next: bool,
}

impl Default for VideoQueueState {
    /// The first accepted frame anchors the base time
    fn default() -> Self {
        Self {
            paused: false,
            encoding_started: false,
            adjust_time_base_next: true,
        }
    }
}

/// Producer side of a video encoder queue
#[derive(Clone)]
pub struct VideoEncoderInput {
    sender: Sender<EncoderMessage<QueuedFrame>>,
    state: Arc<Mutex<VideoQueueState>>,
    max_queue: usize,
}

impl VideoEncoderInput {
    /// Queues a frame. Frames are dropped while paused or when the queue
    /// already holds the maximum number of frames.
    pub fn add_frame(&self, frame: RawVideoFrame) -> bool {
        let mut state = self.state.lock();
        if state.paused {
            state.adjust_time_base_next = true;
            return false;
        }

        let queued = QueuedFrame {
            frame,
            adjust_time_base: state.adjust_time_base_next,
        };
        match self.sender.try_send(EncoderMessage::Frame(queued)) {
            Ok(()) => {
                state.adjust_time_base_next = false;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::debug!("[VideoEncoder] Frame queue full, frame lost");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn can_push(&self) -> bool {
        let state = self.state.lock();
        if state.encoding_started {
            self.sender.len() < self.max_queue
        } else {
            self.sender.is_empty()
        }
    }

    /// Frames currently waiting for the encoder
    pub fn queued_frames(&self) -> usize {
        self.sender.len()
    }
}

impl EncoderQueue<RawVideoFrame> for VideoEncoderInput {
    fn push(&self, item: RawVideoFrame) -> bool {
        self.add_frame(item)
    }

    fn can_push(&self) -> bool {
        VideoEncoderInput::can_push(self)
    }
}

/// Settings the engine passes to each video encoder thread
#[derive(Debug, Clone, Copy)]
pub struct VideoEncoderLimits {
    pub max_queue_frames: usize,
    pub max_dts_repair_drops: u32,
}

/// A video stream's encoder thread, as owned by the engine
pub struct VideoEncoder {
    name: String,
    input: VideoEncoderInput,
    start_sender: Option<Sender<StreamStart>>,
    init_receiver: Receiver<Result<StreamParams, EncoderError>>,
    thread: Option<JoinHandle<()>>,
}

impl VideoEncoder {
    /// Spawns the encoder thread; it opens the codec and then waits for
    /// [`VideoEncoder::start`]
    pub fn spawn(
        name: String,
        source: VideoSourceParams,
        settings: EncoderSettings,
        registry: Arc<CodecRegistry>,
        timeline: Arc<RecordingTimeline>,
        events: Sender<RecorderEvent>,
        limits: VideoEncoderLimits,
    ) -> Result<Self, EncoderError> {
        let max_queue = limits.max_queue_frames.max(1);
        let (sender, receiver) = bounded::<EncoderMessage<QueuedFrame>>(max_queue);
        let (start_sender, start_receiver) = bounded::<StreamStart>(1);
        let (init_sender, init_receiver) = bounded(1);

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name("mediarec-video-encoder".into())
            .spawn(move || {
                let encoder = match VideoFrameEncoder::create(
                    &settings,
                    &source,
                    &registry,
                    limits.max_dts_repair_drops,
                ) {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        log::error!("[VideoEncoder] {}: {}", thread_name, e);
                        let _ = init_sender.send(Err(e));
                        return;
                    }
                };
                let _ = init_sender.send(Ok(encoder.stream_params()));

                let Ok(start) = start_receiver.recv() else {
                    log::debug!("[VideoEncoder] {} released before start", thread_name);
                    return;
                };
                let mut worker = VideoEncoderWorker {
                    encoder,
                    stream_index: start.stream_index,
                    packets: start.packets,
                    timeline,
                    events,
                    frame_rate: source.frame_rate,
                    base_time: 0,
                    last_frame_end: 0,
                    failed: false,
                    frames_sent: 0,
                };
                worker.run(receiver);
            })
            .map_err(|e| EncoderError::Thread(format!("Failed to spawn video encoder thread: {}", e)))?;

        Ok(Self {
            name,
            input: VideoEncoderInput {
                sender,
                state: Arc::new(Mutex::new(VideoQueueState::default())),
                max_queue,
            },
            start_sender: Some(start_sender),
            init_receiver,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> VideoEncoderInput {
        self.input.clone()
    }

    pub fn wait_initialized(&self) -> Result<StreamParams, EncoderError> {
        self.init_receiver
            .recv()
            .map_err(|_| EncoderError::Thread("Video encoder thread exited during init".into()))?
    }

    pub(crate) fn start(&mut self, stream_index: usize, packets: Sender<MuxerMessage>) {
        self.input.state.lock().encoding_started = true;
        if let Some(sender) = self.start_sender.take() {
            let _ = sender.send(StreamStart {
                stream_index,
                packets,
            });
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.input.state.lock().paused = paused;
    }

    /// Encodes what is queued, flushes the codec and joins the thread
    pub fn finish(mut self) {
        // A thread still waiting for its start gives up, which also keeps
        // the send below from blocking on a full queue
        self.start_sender = None;
        let _ = self.input.sender.send(EncoderMessage::Finish);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[VideoEncoder] {} thread panicked", self.name);
            }
        }
    }
}

struct VideoEncoderWorker {
    encoder: VideoFrameEncoder,
    stream_index: usize,
    packets: Sender<MuxerMessage>,
    timeline: Arc<RecordingTimeline>,
    events: Sender<RecorderEvent>,
    frame_rate: f64,
    /// Microseconds subtracted from capture times; grows across pauses
    base_time: i64,
    last_frame_end: i64,
    /// Set once the stream hit an unrecoverable error
    failed: bool,
    frames_sent: u64,
}

impl VideoEncoderWorker {
    fn run(&mut self, receiver: Receiver<EncoderMessage<QueuedFrame>>) {
        log::info!(
            "[VideoEncoder] {} encoding into stream {}",
            self.encoder.encoder_name(),
            self.stream_index
        );

        loop {
            match receiver.recv() {
                Ok(EncoderMessage::Frame(queued)) => self.process_one(queued),
                Ok(EncoderMessage::Finish) | Err(_) => break,
            }
        }

        self.cleanup();
        log::info!(
            "[VideoEncoder] {} finished after {} frames",
            self.encoder.encoder_name(),
            self.frames_sent
        );
    }

    fn retrieve_packets(&mut self) {
        if self.failed {
            return;
        }
        loop {
            match self.encoder.retrieve_packet() {
                Ok(Some(mut packet)) => {
                    packet.stream_index = self.stream_index;
                    if self.packets.send(EncoderMessage::Frame(packet)).is_err() {
                        log::warn!("[VideoEncoder] Muxer gone, dropping packet");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("[VideoEncoder] Stream {} failed: {}", self.stream_index, e);
                    self.failed = true;
                    let _ = self.events.send(RecorderEvent::SessionError {
                        kind: RecorderErrorKind::FormatError,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    /// (start, end) of a frame in microseconds
    fn frame_times(&self, frame: &RawVideoFrame) -> (i64, i64) {
        let (start, end) = match frame.start_time {
            Some(start) => (start, frame.end_time),
            None => (self.last_frame_end, None),
        };
        let end = end.unwrap_or_else(|| {
            let rate = frame.frame_rate.filter(|r| *r > 0.0).unwrap_or(self.frame_rate);
            start + (1_000_000.0 / rate).round() as i64
        });
        (start, end)
    }

    fn process_one(&mut self, queued: QueuedFrame) {
        self.retrieve_packets();
        if self.failed {
            return;
        }

        let QueuedFrame {
            frame,
            adjust_time_base,
        } = queued;
        let (start, end) = self.frame_times(&frame);

        if adjust_time_base {
            self.base_time += start - self.last_frame_end;
            log::debug!(
                "[VideoEncoder] Adjusting base time to {} ({} after {})",
                self.base_time,
                start,
                self.last_frame_end
            );
        }

        let time = start - self.base_time;
        self.last_frame_end = end;

        let pts = self.encoder.pts_for(time);
        self.timeline.new_time_stamp(time / 1000);

        log::trace!("[VideoEncoder] Sending frame pts {} at {} us", pts, time);
        match self.encoder.send_frame(frame, pts) {
            Ok(()) => self.frames_sent += 1,
            Err(e) => log::warn!("[VideoEncoder] Error sending frame: {}", e),
        }
    }

    fn cleanup(&mut self) {
        if self.failed {
            return;
        }
        while let Err(CodecError::Again) = self.encoder.send_end_of_stream() {
            self.retrieve_packets();
            if self.failed {
                return;
            }
        }
        self.retrieve_packets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pts: i64, dts: i64) -> CompressedPacket {
        let mut packet = CompressedPacket::new(vec![0], pts, Rational::MILLIS);
        packet.dts = Some(dts);
        packet
    }

    #[test]
    fn dts_above_pts_is_pulled_back_and_offset_kept() {
        let mut repair = DtsRepair::new(16);

        let mut first = packet(0, 40);
        assert_eq!(repair.fix(&mut first), DtsVerdict::Keep);
        assert_eq!(first.dts, Some(0));

        let mut second = packet(80, 80);
        assert_eq!(repair.fix(&mut second), DtsVerdict::Keep);
        assert_eq!(second.dts, Some(40));
    }

    #[test]
    fn decreasing_dts_is_dropped_then_fatal() {
        let mut repair = DtsRepair::new(2);
        assert_eq!(repair.fix(&mut packet(100, 100)), DtsVerdict::Keep);

        assert_eq!(repair.fix(&mut packet(50, 50)), DtsVerdict::Drop);
        assert_eq!(repair.fix(&mut packet(60, 60)), DtsVerdict::Drop);
        assert_eq!(repair.fix(&mut packet(70, 70)), DtsVerdict::Fatal);
    }

    #[test]
    fn kept_packet_resets_drop_count() {
        let mut repair = DtsRepair::new(1);
        assert_eq!(repair.fix(&mut packet(100, 100)), DtsVerdict::Keep);
        assert_eq!(repair.fix(&mut packet(50, 50)), DtsVerdict::Drop);
        assert_eq!(repair.fix(&mut packet(120, 120)), DtsVerdict::Keep);
        assert_eq!(repair.fix(&mut packet(50, 50)), DtsVerdict::Drop);
    }

    #[test]
    fn frame_rate_inference_order() {
        let format = VideoFrameFormat::new(PixelFormat::Rgb24, Size::new(2, 2));
        let frame = RawVideoFrame::from_memory(PixelFormat::Rgb24, Size::new(2, 2), vec![0u8; 12])
            .with_times(Some(0), Some(40_000));

        assert_eq!(infer_frame_rate(Some(&format.with_frame_rate(50.0)), Some(&frame)), 50.0);
        assert_eq!(infer_frame_rate(Some(&format), Some(&frame)), 25.0);
        assert_eq!(infer_frame_rate(Some(&format), None), DEFAULT_FRAME_RATE);
    }

    fn mjpeg_settings() -> EncoderSettings {
        EncoderSettings {
            video_codec: Some(VideoCodec::Mjpeg),
            hardware_acceleration: false,
            ..EncoderSettings::default()
        }
    }

    #[test]
    fn create_picks_a_software_encoder() {
        let registry = CodecRegistry::with_builtin();
        let source = VideoSourceParams {
            layout: FrameLayout::software(PixelFormat::Rgb24, Size::new(16, 16)),
            frame_rate: 25.0,
        };
        let encoder = VideoFrameEncoder::create(&mjpeg_settings(), &source, &registry, 16).unwrap();

        assert_eq!(encoder.negotiated().size, Size::new(16, 16));
        assert_eq!(encoder.negotiated().target_format, PixelFormat::Rgb24);
        assert_eq!(encoder.time_base(), Rational::new(1, 25_000));
        assert_eq!(encoder.pts_for(1_000_000), 25_000);
        assert!(encoder.stream_params().is_video());
    }

    #[test]
    fn create_without_codec_fails() {
        let registry = CodecRegistry::with_builtin();
        let source = VideoSourceParams {
            layout: FrameLayout::software(PixelFormat::Rgb24, Size::new(16, 16)),
            frame_rate: 25.0,
        };
        let result = VideoFrameEncoder::create(&EncoderSettings::default(), &source, &registry, 16);
        assert!(matches!(result, Err(EncoderError::NoEncoder(_))));
    }

    #[test]
    fn queue_drops_frames_beyond_its_bound() {
        let (sender, _receiver) = bounded(2);
        let input = VideoEncoderInput {
            sender,
            state: Arc::new(Mutex::new(VideoQueueState {
                encoding_started: true,
                ..VideoQueueState::default()
            })),
            max_queue: 2,
        };
        let frame = || RawVideoFrame::from_memory(PixelFormat::Rgb24, Size::new(1, 1), vec![0u8; 3]);

        assert!(input.add_frame(frame()));
        assert!(input.add_frame(frame()));
        assert!(!input.can_push());
        assert!(!input.add_frame(frame()));
        assert_eq!(input.queued_frames(), 2);
    }

    #[test]
    fn frame_after_pause_is_flagged() {
        let (sender, receiver) = bounded(4);
        let input = VideoEncoderInput {
            sender,
            state: Arc::new(Mutex::new(VideoQueueState::default())),
            max_queue: 4,
        };
        let frame = || RawVideoFrame::from_memory(PixelFormat::Rgb24, Size::new(1, 1), vec![0u8; 3]);

        input.state.lock().paused = true;
        assert!(!input.add_frame(frame()));
        input.state.lock().paused = false;
        assert!(input.add_frame(frame()));
        assert!(input.add_frame(frame()));

        let flags: Vec<bool> = receiver
            .try_iter()
            .map(|message| match message {
                EncoderMessage::Frame(queued) => queued.adjust_time_base,
                EncoderMessage::Finish => false,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
    }
}
