//! Audio conversion: sample format, channel layout and sample rate
//!
//! Samples travel as planar `f32` between the stages. Rate conversion runs
//! through rubato's FFT resampler in fixed input chunks; the remainder is
//! kept until the next call or [`AudioResampler::flush`].

use crate::media::{AudioFormat, ChannelLayout, SampleFormat};

use super::{ConvertError, Result};

/// Input frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

/// Decodes samples of `format` into one `f32` vector per channel
pub fn decode_samples(data: &[u8], format: &AudioFormat) -> Vec<Vec<f32>> {
    let channels = format.channel_count() as usize;
    let bytes = format.sample_format.bytes_per_sample();
    let frames = format.frames_for_bytes(data.len());
    let mut out = vec![Vec::with_capacity(frames); channels];

    for frame in 0..frames {
        for (ch, plane) in out.iter_mut().enumerate() {
            let offset = if format.sample_format.is_planar() {
                (ch * frames + frame) * bytes
            } else {
                (frame * channels + ch) * bytes
            };
            plane.push(read_sample(&data[offset..offset + bytes], format.sample_format));
        }
    }
    out
}

fn read_sample(bytes: &[u8], format: SampleFormat) -> f32 {
    match format.packed() {
        SampleFormat::U8 => (f32::from(bytes[0]) - 128.0) / 128.0,
        SampleFormat::S16 => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32768.0,
        SampleFormat::S32 => {
            (f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])) / 2_147_483_648.0) as f32
        }
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            f64::from_le_bytes(b) as f32
        }
    }
}

fn write_sample(out: &mut Vec<u8>, value: f32, format: SampleFormat) {
    match format.packed() {
        SampleFormat::U8 => out.push((value * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8),
        SampleFormat::S16 => {
            let v = (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S32 => {
            let v = (f64::from(value) * 2_147_483_648.0)
                .round()
                .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::F32 => out.extend_from_slice(&value.to_le_bytes()),
        _ => out.extend_from_slice(&f64::from(value).to_le_bytes()),
    }
}

/// Encodes planar `f32` samples into `format`, planes one after another for
/// planar formats.
pub fn encode_samples(planes: &[Vec<f32>], format: SampleFormat) -> Vec<u8> {
    let frames = planes.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(frames * planes.len() * format.bytes_per_sample());
    if format.is_planar() {
        for plane in planes {
            for &v in plane {
                write_sample(&mut out, v, format);
            }
        }
    } else {
        for frame in 0..frames {
            for plane in planes {
                write_sample(&mut out, plane[frame], format);
            }
        }
    }
    out
}

/// Mixing weights: for every output channel, (input channel, weight) pairs
fn mix_matrix(input: ChannelLayout, output: ChannelLayout) -> Vec<Vec<(usize, f32)>> {
    let in_count = input.channel_count() as usize;
    let out_count = output.channel_count() as usize;

    if in_count == 1 {
        return vec![vec![(0, 1.0)]; out_count];
    }
    if out_count == 1 {
        let weight = 1.0 / in_count as f32;
        return vec![(0..in_count).map(|i| (i, weight)).collect()];
    }

    let mut rows: Vec<Vec<(usize, f32)>> = output
        .positions()
        .map(|position| match input.index_of(position) {
            Some(i) => vec![(i, 1.0)],
            None if position == ChannelLayout::FRONT_CENTER => [ChannelLayout::FRONT_LEFT, ChannelLayout::FRONT_RIGHT]
                .iter()
                .filter_map(|p| input.index_of(*p))
                .map(|i| (i, 0.5))
                .collect(),
            None => Vec::new(),
        })
        .collect();

    // Channels with no place in the output are folded into every output channel
    let unmapped: Vec<usize> = input
        .positions()
        .enumerate()
        .filter(|(_, position)| output.index_of(*position).is_none())
        .map(|(i, _)| i)
        .collect();
    if !unmapped.is_empty() {
        for row in &mut rows {
            row.extend(unmapped.iter().map(|&i| (i, 0.5)));
            let total: f32 = row.iter().map(|(_, w)| w).sum();
            for (_, w) in row.iter_mut() {
                *w /= total;
            }
        }
    }
    rows
}

/// Converts audio from one [`AudioFormat`] to another
pub struct AudioResampler {
    input: AudioFormat,
    output: AudioFormat,
    mix: Option<Vec<Vec<(usize, f32)>>>,
    resampler: Option<rubato::FftFixedIn<f32>>,
    /// Remixed samples waiting for a full resampler chunk
    pending: Vec<Vec<f32>>,
    resampled: Vec<Vec<f32>>,
    frames_in: u64,
    frames_out: u64,
}

impl AudioResampler {
    pub fn new(input: AudioFormat, output: AudioFormat) -> Result<Self> {
        if !input.is_valid() || !output.is_valid() {
            return Err(ConvertError::InvalidAudioFormat(format!("{} -> {}", input, output)));
        }
        let out_channels = output.channel_count() as usize;

        let mix = (input.channel_layout != output.channel_layout)
            .then(|| mix_matrix(input.channel_layout, output.channel_layout));

        let resampler = if input.sample_rate != output.sample_rate {
            let resampler = rubato::FftFixedIn::<f32>::new(
                input.sample_rate as usize,
                output.sample_rate as usize,
                RESAMPLE_CHUNK,
                2,
                out_channels,
            )
            .map_err(|e| ConvertError::Resampler(e.to_string()))?;
            Some(resampler)
        } else {
            None
        };
        let resampled = resampler
            .as_ref()
            .map(rubato::Resampler::output_buffer_allocate)
            .unwrap_or_default();

        log::debug!("[AudioResampler] {} -> {}", input, output);

        Ok(Self {
            input,
            output,
            mix,
            resampler,
            pending: vec![Vec::new(); out_channels],
            resampled,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    pub fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    /// Converts a block of input samples. Output may lag behind the input
    /// while the resampler collects a full chunk.
    pub fn convert(&mut self, data: &[u8]) -> Result<Vec<Vec<f32>>> {
        let decoded = decode_samples(data, &self.input);
        let frames = decoded.first().map_or(0, Vec::len);
        self.frames_in += frames as u64;

        let remixed = match &self.mix {
            Some(matrix) => matrix
                .iter()
                .map(|row| {
                    (0..frames)
                        .map(|f| row.iter().map(|&(ch, w)| decoded[ch][f] * w).sum::<f32>())
                        .collect::<Vec<f32>>()
                })
                .collect(),
            None => decoded,
        };

        if self.resampler.is_none() {
            self.frames_out += frames as u64;
            return Ok(remixed);
        }

        for (pending, samples) in self.pending.iter_mut().zip(remixed) {
            pending.extend(samples);
        }
        let mut out = vec![Vec::new(); self.pending.len()];
        while self.pending.first().map_or(0, Vec::len) >= RESAMPLE_CHUNK {
            self.process_chunk(&mut out)?;
        }
        self.frames_out += out.first().map_or(0, Vec::len) as u64;
        Ok(out)
    }

    /// Emits everything still buffered; the total output of the resampler
    /// then matches the input duration at the output rate.
    pub fn flush(&mut self) -> Result<Vec<Vec<f32>>> {
        let mut out = vec![Vec::new(); self.pending.len()];
        if self.resampler.is_none() {
            return Ok(out);
        }

        let expected = (self.frames_in as u128 * u128::from(self.output.sample_rate)
            + u128::from(self.input.sample_rate) / 2)
            / u128::from(self.input.sample_rate);
        let expected = expected as u64;

        // Zero padding pushes the resampler's internal delay out as well
        let mut guard = 0;
        while self.frames_out + (out[0].len() as u64) < expected && guard < 64 {
            for pending in &mut self.pending {
                pending.resize(pending.len().max(RESAMPLE_CHUNK), 0.0);
            }
            self.process_chunk(&mut out)?;
            guard += 1;
        }
        for pending in &mut self.pending {
            pending.clear();
        }

        let keep = expected.saturating_sub(self.frames_out) as usize;
        for plane in &mut out {
            plane.truncate(keep);
        }
        self.frames_out += out.first().map_or(0, Vec::len) as u64;
        Ok(out)
    }

    fn process_chunk(&mut self, out: &mut [Vec<f32>]) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let frames_out = rubato::Resampler::output_frames_next(resampler);
        {
            let input: Vec<&[f32]> = self.pending.iter().map(|p| &p[..RESAMPLE_CHUNK]).collect();
            rubato::Resampler::process_into_buffer(resampler, &input, &mut self.resampled, None)
                .map_err(|e| ConvertError::Resampler(e.to_string()))?;
        }
        for pending in &mut self.pending {
            pending.drain(..RESAMPLE_CHUNK);
        }
        for (dst, src) in out.iter_mut().zip(&self.resampled) {
            dst.extend_from_slice(&src[..frames_out.min(src.len())]);
        }
        Ok(())
    }
}

/// Holds converted samples until a codec frame can be cut
pub struct SampleFifo {
    format: AudioFormat,
    /// One buffer per channel for planar formats, one interleaved buffer
    /// otherwise
    planes: Vec<Vec<u8>>,
}

impl SampleFifo {
    pub fn new(format: AudioFormat) -> Self {
        let count = if format.sample_format.is_planar() {
            format.channel_count() as usize
        } else {
            1
        };
        Self {
            format,
            planes: vec![Vec::new(); count],
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Frames currently buffered
    pub fn len(&self) -> usize {
        let bytes = self.planes.first().map_or(0, Vec::len);
        let per_frame = if self.format.sample_format.is_planar() {
            self.format.sample_format.bytes_per_sample()
        } else {
            self.format.bytes_per_frame()
        };
        bytes / per_frame.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends samples already in the FIFO's format (planes concatenated
    /// for planar formats)
    pub fn push_bytes(&mut self, data: &[u8]) {
        if self.planes.len() == 1 {
            self.planes[0].extend_from_slice(data);
            return;
        }
        let plane_len = data.len() / self.planes.len();
        for (plane, chunk) in self.planes.iter_mut().zip(data.chunks(plane_len.max(1))) {
            plane.extend_from_slice(chunk);
        }
    }

    /// Appends planar `f32` samples, encoding them into the FIFO's format
    pub fn push_planes(&mut self, planes: &[Vec<f32>]) {
        if planes.first().map_or(true, Vec::is_empty) {
            return;
        }
        let encoded = encode_samples(planes, self.format.sample_format);
        self.push_bytes(&encoded);
    }

    /// Removes up to `frames` frames; planar formats come out with their
    /// planes one after another
    pub fn pop(&mut self, frames: usize) -> Vec<u8> {
        let frames = frames.min(self.len());
        let bytes = if self.planes.len() == 1 {
            frames * self.format.bytes_per_frame()
        } else {
            frames * self.format.sample_format.bytes_per_sample()
        };
        let mut out = Vec::with_capacity(bytes * self.planes.len());
        for plane in &mut self.planes {
            out.extend(plane.drain(..bytes));
        }
        out
    }

    pub fn pop_all(&mut self) -> Vec<u8> {
        self.pop(self.len())
    }
}
