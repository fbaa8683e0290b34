//! Audio encoder thread
//!
//! Buffers are queued without a bound but with their duration accounted, so
//! producers can poll [`AudioEncoderInput::can_push`] for backpressure. The
//! thread converts every buffer into the codec's format, cuts codec frames
//! out of a sample FIFO and stamps them with the count of samples written
//! so far.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::container::StreamParams;
use crate::convert::{AudioResampler, SampleFifo};
use crate::config::EncoderSettings;
use crate::encoding::codec::{AudioEncoderConfig, AudioEncoderContext, CodecRegistry, EncoderAudioFrame};
use crate::encoding::CodecError;
use crate::media::{AudioFormat, RawAudioBuffer, Rational};
use crate::negotiation::{audio_encoder_score, negotiate_audio, rank_by_score, AudioNegotiation};

use super::muxer::{MuxerMessage, StreamStart};
use super::source::EncoderQueue;
use super::timeline::RecordingTimeline;
use super::{EncoderError, EncoderMessage};

#[derive(Debug, Default)]
struct AudioQueueState {
    paused: bool,
    encoding_started: bool,
    queued_buffers: usize,
    queued_us: i64,
}

#[derive(Debug)]
struct AudioShared {
    state: Mutex<AudioQueueState>,
    max_queue_us: i64,
}

impl AudioShared {
    fn dequeued(&self, duration_us: i64) {
        let mut state = self.state.lock();
        state.queued_buffers = state.queued_buffers.saturating_sub(1);
        state.queued_us -= duration_us;
    }
}

/// Producer side of an audio encoder queue
#[derive(Clone)]
pub struct AudioEncoderInput {
    sender: Sender<EncoderMessage<RawAudioBuffer>>,
    shared: Arc<AudioShared>,
}

impl AudioEncoderInput {
    /// Queues a buffer. Returns false when it was dropped because the
    /// encoder is paused or gone.
    pub fn add_buffer(&self, buffer: RawAudioBuffer) -> bool {
        let duration = buffer.duration_us();
        {
            let mut state = self.shared.state.lock();
            if state.paused {
                return false;
            }
            state.queued_buffers += 1;
            state.queued_us += duration;
        }

        if self.sender.send(EncoderMessage::Frame(buffer)).is_err() {
            self.shared.dequeued(duration);
            return false;
        }
        true
    }

    /// Before encoding starts only an empty queue takes data; afterwards
    /// up to the configured queue duration (always at least one buffer).
    pub fn can_push(&self) -> bool {
        let state = self.shared.state.lock();
        if !state.encoding_started {
            return state.queued_buffers == 0;
        }
        state.queued_buffers <= 1 || state.queued_us < self.shared.max_queue_us
    }

    pub fn queued_duration_us(&self) -> i64 {
        self.shared.state.lock().queued_us
    }
}

impl EncoderQueue<RawAudioBuffer> for AudioEncoderInput {
    fn push(&self, item: RawAudioBuffer) -> bool {
        self.add_buffer(item)
    }

    fn can_push(&self) -> bool {
        AudioEncoderInput::can_push(self)
    }
}

/// An audio stream's encoder thread, as owned by the engine
pub struct AudioEncoder {
    name: String,
    input: AudioEncoderInput,
    start_sender: Option<Sender<StreamStart>>,
    init_receiver: Receiver<Result<StreamParams, EncoderError>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioEncoder {
    /// Spawns the encoder thread. It opens the codec right away and then
    /// waits for [`AudioEncoder::start`] before it encodes anything.
    pub fn spawn(
        name: String,
        source_format: AudioFormat,
        settings: EncoderSettings,
        registry: Arc<CodecRegistry>,
        timeline: Arc<RecordingTimeline>,
        max_queue_ms: u64,
    ) -> Result<Self, EncoderError> {
        let (sender, receiver) = unbounded::<EncoderMessage<RawAudioBuffer>>();
        let (start_sender, start_receiver) = bounded::<StreamStart>(1);
        let (init_sender, init_receiver) = bounded(1);

        let shared = Arc::new(AudioShared {
            state: Mutex::new(AudioQueueState::default()),
            max_queue_us: max_queue_ms as i64 * 1000,
        });

        let thread_shared = shared.clone();
        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name("mediarec-audio-encoder".into())
            .spawn(move || {
                let encoder = match AudioStreamEncoder::open(&settings, &registry, source_format) {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        log::error!("[AudioEncoder] {}: {}", thread_name, e);
                        let _ = init_sender.send(Err(e));
                        return;
                    }
                };
                let _ = init_sender.send(Ok(encoder.stream_params(&settings)));

                let Ok(start) = start_receiver.recv() else {
                    log::debug!("[AudioEncoder] {} released before start", thread_name);
                    return;
                };
                encoder.run(receiver, start, thread_shared, timeline);
            })
            .map_err(|e| EncoderError::Thread(format!("Failed to spawn audio encoder thread: {}", e)))?;

        Ok(Self {
            name,
            input: AudioEncoderInput { sender, shared },
            start_sender: Some(start_sender),
            init_receiver,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> AudioEncoderInput {
        self.input.clone()
    }

    /// Blocks until the codec is open; returns the stream to register
    pub fn wait_initialized(&self) -> Result<StreamParams, EncoderError> {
        self.init_receiver
            .recv()
            .map_err(|_| EncoderError::Thread("Audio encoder thread exited during init".into()))?
    }

    /// Lets the thread start encoding into `stream_index`
    pub(crate) fn start(&mut self, stream_index: usize, packets: Sender<MuxerMessage>) {
        self.input.shared.state.lock().encoding_started = true;
        if let Some(sender) = self.start_sender.take() {
            let _ = sender.send(StreamStart {
                stream_index,
                packets,
            });
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.input.shared.state.lock().paused = paused;
    }

    /// Drains the queue, flushes the codec and joins the thread
    pub fn finish(mut self) {
        // A thread still waiting for its start gives up
        self.start_sender = None;
        let _ = self.input.sender.send(EncoderMessage::Finish);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[AudioEncoder] {} thread panicked", self.name);
            }
        }
    }
}

/// Opened codec plus the conversion state feeding it
struct AudioStreamEncoder {
    encoder_name: String,
    context: AudioEncoderContext,
    negotiated: AudioNegotiation,
    source_format: AudioFormat,
    resampler: Option<AudioResampler>,
    /// False while buffers in `source_format` cannot be converted
    source_usable: bool,
    fifo: SampleFifo,
    samples_written: i64,
}

impl AudioStreamEncoder {
    /// Opens the best suited encoder of the configured codec
    fn open(
        settings: &EncoderSettings,
        registry: &CodecRegistry,
        source_format: AudioFormat,
    ) -> Result<Self, EncoderError> {
        if !source_format.is_valid() {
            return Err(EncoderError::InvalidSource(source_format.to_string()));
        }

        let candidates = rank_by_score(registry.audio_encoders(settings.audio_codec), |factory| {
            audio_encoder_score(factory.descriptor(), &source_format)
        });
        if candidates.is_empty() {
            return Err(EncoderError::NoEncoder(format!(
                "no {} encoder available",
                settings.audio_codec.display_name()
            )));
        }

        let mut last_error: Option<EncoderError> = None;
        for (factory, score) in candidates {
            let descriptor = factory.descriptor();
            let negotiated = match negotiate_audio(descriptor, &source_format, settings) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    log::warn!("[AudioEncoder] Skipping {}: {}", descriptor.name, e);
                    last_error = Some(e.into());
                    continue;
                }
            };
            let config = AudioEncoderConfig {
                format: negotiated.format,
                time_base: negotiated.time_base,
                options: descriptor.family.apply_audio(settings),
            };

            match factory.open(&config) {
                Ok(context) => {
                    log::info!(
                        "[AudioEncoder] Opened {} (score {}): {} -> {}",
                        descriptor.name,
                        score,
                        source_format,
                        negotiated.format
                    );
                    let mut encoder = Self {
                        encoder_name: descriptor.name.clone(),
                        context,
                        negotiated,
                        source_format,
                        resampler: None,
                        source_usable: true,
                        fifo: SampleFifo::new(negotiated.format),
                        samples_written: 0,
                    };
                    encoder.configure_source(source_format);
                    return Ok(encoder);
                }
                Err(e) => {
                    log::warn!("[AudioEncoder] Failed to open {}: {}", descriptor.name, e);
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| EncoderError::NoEncoder("no encoder could be opened".into())))
    }

    fn stream_params(&self, settings: &EncoderSettings) -> StreamParams {
        let format = self.negotiated.format;
        StreamParams::audio(
            settings.audio_codec,
            format.sample_rate,
            format.channel_count(),
            self.negotiated.time_base,
        )
        .with_codec_private(self.context.extradata())
    }

    fn configure_source(&mut self, format: AudioFormat) {
        // Samples still held by the old conversion belong to the stream
        self.flush_resampler();
        self.source_format = format;
        self.resampler = None;
        self.source_usable = true;
        if format == self.negotiated.format {
            return;
        }
        match AudioResampler::new(format, self.negotiated.format) {
            Ok(resampler) => self.resampler = Some(resampler),
            Err(e) => {
                log::warn!("[AudioEncoder] Cannot convert {}: {}", format, e);
                self.source_usable = false;
            }
        }
    }

    fn run(
        mut self,
        receiver: Receiver<EncoderMessage<RawAudioBuffer>>,
        start: StreamStart,
        shared: Arc<AudioShared>,
        timeline: Arc<RecordingTimeline>,
    ) {
        let mut output = PacketOutput {
            stream_index: start.stream_index,
            packets: start.packets,
            timeline,
            sample_rate: self.negotiated.format.sample_rate,
        };
        log::info!(
            "[AudioEncoder] {} encoding into stream {}",
            self.encoder_name,
            output.stream_index
        );

        loop {
            match receiver.recv() {
                Ok(EncoderMessage::Frame(buffer)) => {
                    shared.dequeued(buffer.duration_us());
                    self.process_buffer(buffer, &mut output);
                }
                Ok(EncoderMessage::Finish) | Err(_) => break,
            }
        }

        self.cleanup(&mut output);
        log::info!(
            "[AudioEncoder] {} finished after {} samples",
            self.encoder_name,
            self.samples_written
        );
    }

    fn process_buffer(&mut self, buffer: RawAudioBuffer, output: &mut PacketOutput) {
        if buffer.format != self.source_format {
            log::info!(
                "[AudioEncoder] Source format changed from {} to {}",
                self.source_format,
                buffer.format
            );
            self.configure_source(buffer.format);
        }
        if !self.source_usable {
            return;
        }

        match &mut self.resampler {
            Some(resampler) => match resampler.convert(&buffer.data) {
                Ok(planes) => self.fifo.push_planes(&planes),
                Err(e) => {
                    log::warn!("[AudioEncoder] Dropping buffer: {}", e);
                    return;
                }
            },
            None => self.fifo.push_bytes(&buffer.data),
        }

        self.encode_available(output);
    }

    /// Sends every whole codec frame in the FIFO; variable frame size
    /// codecs take everything at once
    fn encode_available(&mut self, output: &mut PacketOutput) {
        match self.negotiated.frame_size {
            Some(frame_size) if frame_size > 0 => {
                while self.fifo.len() >= frame_size {
                    let data = self.fifo.pop(frame_size);
                    self.send_samples(data, frame_size, output);
                }
            }
            _ => {
                let samples = self.fifo.len();
                if samples > 0 {
                    let data = self.fifo.pop_all();
                    self.send_samples(data, samples, output);
                }
            }
        }
    }

    fn send_samples(&mut self, data: Vec<u8>, samples: usize, output: &mut PacketOutput) {
        output.retrieve_packets(&mut self.context);

        let rate = self.negotiated.format.sample_rate as i64;
        let pts = Rational::rescale(self.samples_written, Rational::new(1, rate), self.negotiated.time_base);
        let frame = EncoderAudioFrame { data, samples, pts };

        if let Err(e) = self.context.send_frame(Some(frame)) {
            log::warn!("[AudioEncoder] Failed to send {} samples: {}", samples, e);
        }

        self.samples_written += samples as i64;
        output.timeline.new_time_stamp(self.samples_written * 1000 / rate);
    }

    /// Moves what the resampler still holds into the FIFO
    fn flush_resampler(&mut self) {
        if !self.source_usable {
            return;
        }
        if let Some(resampler) = &mut self.resampler {
            match resampler.flush() {
                Ok(planes) => self.fifo.push_planes(&planes),
                Err(e) => log::warn!("[AudioEncoder] Resampler flush failed: {}", e),
            }
        }
    }

    fn cleanup(&mut self, output: &mut PacketOutput) {
        self.flush_resampler();
        self.encode_available(output);
        let remaining = self.fifo.len();
        if remaining > 0 {
            let data = self.fifo.pop_all();
            self.send_samples(data, remaining, output);
        }

        while let Err(CodecError::Again) = self.context.send_frame(None) {
            output.retrieve_packets(&mut self.context);
        }
        output.retrieve_packets(&mut self.context);
    }
}

/// Where encoded packets go once the stream is registered
struct PacketOutput {
    stream_index: usize,
    packets: Sender<MuxerMessage>,
    timeline: Arc<RecordingTimeline>,
    sample_rate: u32,
}

impl PacketOutput {
    fn retrieve_packets(&mut self, context: &mut AudioEncoderContext) {
        loop {
            match context.receive_packet() {
                Ok(mut packet) => {
                    packet.stream_index = self.stream_index;
                    log::trace!(
                        "[AudioEncoder] Packet pts {:?} duration {} ({} Hz)",
                        packet.pts,
                        packet.duration,
                        self.sample_rate
                    );
                    if self.packets.send(EncoderMessage::Frame(packet)).is_err() {
                        log::warn!("[AudioEncoder] Muxer gone, dropping packet");
                    }
                }
                Err(CodecError::Again) | Err(CodecError::Eof) => break,
                Err(e) => {
                    log::warn!("[AudioEncoder] Failed to receive packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::AudioCodec;
    use crate::media::{ChannelLayout, SampleFormat};

    fn mono_s16(rate: u32) -> AudioFormat {
        AudioFormat::new(SampleFormat::S16, rate, ChannelLayout::MONO)
    }

    fn spawn(settings: EncoderSettings, source: AudioFormat) -> (AudioEncoder, Receiver<MuxerMessage>) {
        let (events, _) = unbounded();
        let timeline = Arc::new(RecordingTimeline::new(events));
        let registry = Arc::new(CodecRegistry::with_builtin());
        let mut encoder =
            AudioEncoder::spawn("test".into(), source, settings, registry, timeline, 5000).unwrap();
        encoder.wait_initialized().unwrap();
        let (packets, packet_rx) = unbounded();
        encoder.start(0, packets);
        (encoder, packet_rx)
    }

    fn total_duration(packets: &Receiver<MuxerMessage>) -> i64 {
        packets
            .try_iter()
            .map(|message| match message {
                EncoderMessage::Frame(packet) => packet.duration,
                EncoderMessage::Finish => 0,
            })
            .sum()
    }

    #[test]
    fn pcm_keeps_every_sample() {
        let format = mono_s16(44100);
        let (encoder, packets) = spawn(EncoderSettings::default(), format);
        let input = encoder.input();

        for i in 0..10 {
            assert!(input.add_buffer(RawAudioBuffer::new(vec![0; 4410 * 2], format, i * 100_000)));
        }
        encoder.finish();

        assert_eq!(total_duration(&packets), 44100);
    }

    #[test]
    fn resampled_duration_is_conserved() {
        let format = mono_s16(44100);
        let settings = EncoderSettings {
            audio_sample_rate: Some(48000),
            ..EncoderSettings::default()
        };
        let (encoder, packets) = spawn(settings, format);
        let input = encoder.input();

        for i in 0..10 {
            input.add_buffer(RawAudioBuffer::new(vec![0; 4410 * 2], format, i * 100_000));
        }
        encoder.finish();

        assert_eq!(total_duration(&packets), 48000);
    }

    #[test]
    fn format_switch_keeps_samples_held_by_the_resampler() {
        let mono = mono_s16(44100);
        let stereo = AudioFormat::new(SampleFormat::S16, 44100, ChannelLayout::STEREO);
        let settings = EncoderSettings {
            audio_sample_rate: Some(48000),
            ..EncoderSettings::default()
        };
        let (encoder, packets) = spawn(settings, mono);
        let input = encoder.input();

        for i in 0..5 {
            assert!(input.add_buffer(RawAudioBuffer::new(vec![0; 4410 * 2], mono, i * 100_000)));
        }
        for i in 5..10 {
            assert!(input.add_buffer(RawAudioBuffer::new(vec![0; 4410 * 4], stereo, i * 100_000)));
        }
        encoder.finish();

        assert_eq!(total_duration(&packets), 48000);
    }

    #[test]
    fn paused_encoder_drops_buffers() {
        let format = mono_s16(48000);
        let (encoder, packets) = spawn(EncoderSettings::default(), format);
        let input = encoder.input();

        encoder.set_paused(true);
        assert!(!input.add_buffer(RawAudioBuffer::new(vec![0; 960], format, 0)));
        encoder.set_paused(false);
        assert!(input.add_buffer(RawAudioBuffer::new(vec![0; 960], format, 10_000)));
        encoder.finish();

        assert_eq!(total_duration(&packets), 480);
    }

    #[test]
    fn can_push_follows_queued_duration() {
        let (sender, _receiver) = unbounded();
        let input = AudioEncoderInput {
            sender,
            shared: Arc::new(AudioShared {
                state: Mutex::new(AudioQueueState::default()),
                max_queue_us: 100_000,
            }),
        };
        let format = mono_s16(1000);
        let buffer = || RawAudioBuffer::new(vec![0; 120], format, 0);

        assert!(input.can_push());
        input.add_buffer(buffer());
        assert!(!input.can_push(), "only an empty queue takes data before encoding starts");

        input.shared.state.lock().encoding_started = true;
        assert!(input.can_push());
        input.add_buffer(buffer());
        assert!(!input.can_push());
        assert_eq!(input.queued_duration_us(), 120_000);
    }

    #[test]
    fn missing_codec_fails_initialization() {
        let (events, _) = unbounded();
        let timeline = Arc::new(RecordingTimeline::new(events));
        let settings = EncoderSettings {
            audio_codec: AudioCodec::Opus,
            ..EncoderSettings::default()
        };
        let encoder = AudioEncoder::spawn(
            "test".into(),
            mono_s16(48000),
            settings,
            Arc::new(CodecRegistry::with_builtin()),
            timeline,
            5000,
        )
        .unwrap();
        assert!(matches!(encoder.wait_initialized(), Err(EncoderError::NoEncoder(_))));
        encoder.finish();
    }
}
