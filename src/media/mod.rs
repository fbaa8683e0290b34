// Raw media model: formats, frames, packets and hardware surfaces

pub mod format;
pub mod frame;
pub mod hwaccel;

pub use format::{
    AudioFormat, ChannelLayout, PixelFormat, PixelFormatDescriptor, PlaneLayout, Rational,
    SampleFormat, Size, VideoFrameFormat,
};
pub use frame::{CompressedPacket, FrameBuffer, RawAudioBuffer, RawVideoFrame};
pub use hwaccel::{HwAccel, HwAccelError, HwDeviceType, HwSurface};
