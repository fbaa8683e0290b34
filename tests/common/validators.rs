#![allow(dead_code)]

use std::path::Path;

// ── Matroska validation ──────────────────────────────────────────────

const ID_EBML: u32 = 0x1A45_DFA3;
const ID_DOC_TYPE: u32 = 0x4282;
const ID_SEGMENT: u32 = 0x1853_8067;
const ID_INFO: u32 = 0x1549_A966;
const ID_TIMECODE_SCALE: u32 = 0x2A_D7B1;
const ID_DURATION: u32 = 0x4489;
const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC_ID: u32 = 0x86;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;
const ID_CLUSTER: u32 = 0x1F43_B675;
const ID_TIMECODE: u32 = 0xE7;
const ID_SIMPLE_BLOCK: u32 = 0xA3;
const ID_CUES: u32 = 0x1C53_BB6B;

pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const TRACK_TYPE_AUDIO: u64 = 2;

#[derive(Debug, Default, Clone)]
pub struct MkvTrack {
    pub number: u64,
    pub track_type: u64,
    pub codec_id: String,
    pub width: u64,
    pub height: u64,
    pub sample_rate: f64,
    pub channels: u64,
}

#[derive(Debug, Clone)]
pub struct MkvBlock {
    pub track: u64,
    /// Absolute timestamp (cluster timecode + block offset) in ms
    pub timestamp_ms: i64,
    pub key_frame: bool,
    pub size: usize,
}

#[derive(Debug)]
pub struct MkvValidation {
    pub doc_type: String,
    pub duration_ms: f64,
    pub tracks: Vec<MkvTrack>,
    pub blocks: Vec<MkvBlock>,
    pub has_cues: bool,
}

impl MkvValidation {
    pub fn tracks_of_type(&self, track_type: u64) -> Vec<&MkvTrack> {
        self.tracks.iter().filter(|t| t.track_type == track_type).collect()
    }

    pub fn blocks_for(&self, track: u64) -> Vec<&MkvBlock> {
        self.blocks.iter().filter(|b| b.track == track).collect()
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, String> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| format!("Unexpected end of data at {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    /// Element ID, marker bits kept
    fn id(&mut self) -> Result<u32, String> {
        let first = self.byte()?;
        let width = first.leading_zeros() as usize + 1;
        if width > 4 {
            return Err(format!("Invalid element ID byte 0x{:02X} at {}", first, self.pos - 1));
        }
        let mut id = first as u32;
        for _ in 1..width {
            id = (id << 8) | self.byte()? as u32;
        }
        Ok(id)
    }

    /// Element size; `None` for the reserved "unknown" value
    fn size(&mut self) -> Result<Option<u64>, String> {
        let first = self.byte()?;
        let width = first.leading_zeros() as usize + 1;
        if width > 8 {
            return Err(format!("Invalid size byte 0x{:02X} at {}", first, self.pos - 1));
        }
        let mut value = (first as u64) & (0xFF >> width);
        let mut all_ones = value == (0xFF >> width);
        for _ in 1..width {
            let b = self.byte()?;
            all_ones &= b == 0xFF;
            value = (value << 8) | b as u64;
        }
        Ok(if all_ones { None } else { Some(value) })
    }

    /// Next (id, payload) pair; unknown sizes extend to the end of the data
    fn element(&mut self) -> Result<(u32, &'a [u8]), String> {
        let id = self.id()?;
        let size = self.size()?;
        let end = match size {
            Some(size) => self.pos + size as usize,
            None => self.data.len(),
        };
        if end > self.data.len() {
            return Err(format!("Element 0x{:X} at {} overruns the file", id, self.pos));
        }
        let payload = &self.data[self.pos..end];
        self.pos = end;
        Ok((id, payload))
    }
}

fn read_uint(payload: &[u8]) -> u64 {
    payload.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn read_float(payload: &[u8]) -> Result<f64, String> {
    match payload.len() {
        4 => Ok(f32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as f64),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(payload);
            Ok(f64::from_be_bytes(bytes))
        }
        0 => Ok(0.0),
        n => Err(format!("Float element of {} bytes", n)),
    }
}

fn parse_track(payload: &[u8]) -> Result<MkvTrack, String> {
    let mut track = MkvTrack::default();
    let mut reader = Reader::new(payload);
    while !reader.at_end() {
        let (id, data) = reader.element()?;
        match id {
            ID_TRACK_NUMBER => track.number = read_uint(data),
            ID_TRACK_TYPE => track.track_type = read_uint(data),
            ID_CODEC_ID => track.codec_id = String::from_utf8_lossy(data).into_owned(),
            ID_VIDEO => {
                let mut video = Reader::new(data);
                while !video.at_end() {
                    let (id, data) = video.element()?;
                    match id {
                        ID_PIXEL_WIDTH => track.width = read_uint(data),
                        ID_PIXEL_HEIGHT => track.height = read_uint(data),
                        _ => {}
                    }
                }
            }
            ID_AUDIO => {
                let mut audio = Reader::new(data);
                while !audio.at_end() {
                    let (id, data) = audio.element()?;
                    match id {
                        ID_SAMPLING_FREQUENCY => track.sample_rate = read_float(data)?,
                        ID_CHANNELS => track.channels = read_uint(data),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if track.number == 0 {
        return Err("TrackEntry without TrackNumber".into());
    }
    Ok(track)
}

fn parse_cluster(payload: &[u8], blocks: &mut Vec<MkvBlock>) -> Result<(), String> {
    let mut reader = Reader::new(payload);
    let mut cluster_ts: Option<i64> = None;
    while !reader.at_end() {
        let (id, data) = reader.element()?;
        match id {
            ID_TIMECODE => cluster_ts = Some(read_uint(data) as i64),
            ID_SIMPLE_BLOCK => {
                let base = cluster_ts.ok_or("SimpleBlock before cluster Timecode")?;
                let mut block = Reader::new(data);
                let track = block.size()?.ok_or("SimpleBlock with unknown track number")?;
                if data.len() < block.pos + 3 {
                    return Err("SimpleBlock too small".into());
                }
                let relative = i16::from_be_bytes([data[block.pos], data[block.pos + 1]]);
                let flags = data[block.pos + 2];
                blocks.push(MkvBlock {
                    track,
                    timestamp_ms: base + relative as i64,
                    key_frame: flags & 0x80 != 0,
                    size: data.len() - block.pos - 3,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse and validate a Matroska/WebM file by walking its EBML elements.
pub fn validate_mkv(path: &Path) -> Result<MkvValidation, String> {
    let data = std::fs::read(path).map_err(|e| format!("Failed to read file: {}", e))?;
    if data.len() < 4 {
        return Err(format!("File too small ({} bytes)", data.len()));
    }

    let mut top = Reader::new(&data);
    let (id, header) = top.element()?;
    if id != ID_EBML {
        return Err("Missing EBML header".into());
    }
    let mut doc_type = String::new();
    let mut header_reader = Reader::new(header);
    while !header_reader.at_end() {
        let (id, data) = header_reader.element()?;
        if id == ID_DOC_TYPE {
            doc_type = String::from_utf8_lossy(data).into_owned();
        }
    }

    let (id, segment) = top.element()?;
    if id != ID_SEGMENT {
        return Err(format!("Expected Segment, found 0x{:X}", id));
    }

    let mut timecode_scale = 1_000_000u64;
    let mut duration = None;
    let mut tracks = Vec::new();
    let mut blocks = Vec::new();
    let mut has_cues = false;

    let mut reader = Reader::new(segment);
    while !reader.at_end() {
        let (id, payload) = reader.element()?;
        match id {
            ID_INFO => {
                let mut info = Reader::new(payload);
                while !info.at_end() {
                    let (id, data) = info.element()?;
                    match id {
                        ID_TIMECODE_SCALE => timecode_scale = read_uint(data),
                        ID_DURATION => duration = Some(read_float(data)?),
                        _ => {}
                    }
                }
            }
            ID_TRACKS => {
                let mut entries = Reader::new(payload);
                while !entries.at_end() {
                    let (id, data) = entries.element()?;
                    if id == ID_TRACK_ENTRY {
                        tracks.push(parse_track(data)?);
                    }
                }
            }
            ID_CLUSTER => parse_cluster(payload, &mut blocks)?,
            ID_CUES => has_cues = true,
            _ => {}
        }
    }

    if tracks.is_empty() {
        return Err("No tracks".into());
    }
    let duration = duration.ok_or("No Duration in segment Info")?;

    Ok(MkvValidation {
        doc_type,
        duration_ms: duration * timecode_scale as f64 / 1_000_000.0,
        tracks,
        blocks,
        has_cues,
    })
}
