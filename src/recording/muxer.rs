use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::container::ContainerWriter;
use crate::media::CompressedPacket;

use super::{EncoderError, EncoderMessage};

pub(crate) type MuxerMessage = EncoderMessage<CompressedPacket>;

/// Handed to an encoder thread once its stream is registered in the
/// container
pub(crate) struct StreamStart {
    pub stream_index: usize,
    pub packets: Sender<MuxerMessage>,
}

/// Single consumer of every encoder's packets. Owns the container while
/// encoding and gives it back on `finish`.
pub struct Muxer {
    sender: Sender<MuxerMessage>,
    thread: Option<JoinHandle<Box<dyn ContainerWriter>>>,
}

impl Muxer {
    /// Starts the muxer thread; the header must already be written
    pub fn start(container: Box<dyn ContainerWriter>) -> Result<Self, EncoderError> {
        let (sender, receiver) = unbounded::<MuxerMessage>();

        let thread = std::thread::Builder::new()
            .name("mediarec-muxer".into())
            .spawn(move || Self::muxer_thread_main(receiver, container))
            .map_err(|e| EncoderError::Thread(format!("Failed to spawn muxer thread: {}", e)))?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    pub(crate) fn sender(&self) -> Sender<MuxerMessage> {
        self.sender.clone()
    }

    /// Writes out everything queued so far and returns the container.
    /// Encoder threads must be finished first.
    pub fn finish(mut self) -> Option<Box<dyn ContainerWriter>> {
        let _ = self.sender.send(EncoderMessage::Finish);
        let handle = self.thread.take()?;
        match handle.join() {
            Ok(container) => Some(container),
            Err(_) => {
                log::error!("[Muxer] Muxer thread panicked");
                None
            }
        }
    }

    fn muxer_thread_main(
        receiver: Receiver<MuxerMessage>,
        mut container: Box<dyn ContainerWriter>,
    ) -> Box<dyn ContainerWriter> {
        let mut packets_written = 0u64;
        let mut failures = 0u64;

        loop {
            match receiver.recv() {
                Ok(EncoderMessage::Frame(packet)) => {
                    let stream = packet.stream_index;
                    match container.write_interleaved(packet) {
                        Ok(()) => packets_written += 1,
                        Err(e) => {
                            failures += 1;
                            log::warn!("[Muxer] Dropping packet of stream {}: {}", stream, e);
                        }
                    }
                }
                Ok(EncoderMessage::Finish) | Err(_) => break,
            }
        }

        log::info!(
            "[Muxer] Finished: {} packets written, {} dropped",
            packets_written,
            failures
        );
        container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{MatroskaWriter, StreamParams};
    use crate::encoding::{AudioCodec, ContainerFormat};
    use crate::media::Rational;
    use std::io::Cursor;

    #[test]
    fn hands_the_container_back_after_writing_packets() {
        let mut writer = MatroskaWriter::new(Cursor::new(Vec::new()), ContainerFormat::Mkv, 10_000);
        let tb = Rational::new(1, 48000);
        writer
            .add_stream(StreamParams::audio(AudioCodec::PcmS16le, 48000, 1, tb))
            .unwrap();
        writer.write_header().unwrap();

        let muxer = Muxer::start(Box::new(writer)).unwrap();
        let sender = muxer.sender();
        for i in 0..3 {
            let mut packet = CompressedPacket::new(vec![0; 960], i * 480, tb);
            packet.duration = 480;
            sender.send(EncoderMessage::Frame(packet)).unwrap();
        }
        drop(sender);

        let mut container = muxer.finish().unwrap();
        assert_eq!(container.stream_count(), 1);
        container.write_trailer().unwrap();
        container.close().unwrap();
    }
}
