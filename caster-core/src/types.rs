use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::encoder::EncoderRef;

/// Upper bound on audio tracks a single output can carry.
pub const MAX_AUDIO_MIXES: usize = 6;

/// Number of sample frames in every block emitted by the raw audio path.
pub const AUDIO_OUTPUT_FRAMES: usize = 1024;

/// Captions are split into lines of at most this many bytes.
pub const CAPTION_LINE_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub Arc<str>);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for OutputId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioChannels {
    Mono,
    Stereo,
}

impl AudioChannels {
    pub fn count(&self) -> usize {
        match self {
            AudioChannels::Mono => 1,
            AudioChannels::Stereo => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000u64 * self.den as u64 / self.num as u64)
    }
}

/// Rational time unit of a packet's pts/dts values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timebase {
    pub num: u32,
    pub den: u32,
}

impl Timebase {
    /// Converts a timestamp expressed in this timebase to microseconds.
    pub fn to_usec(&self, ts: i64) -> i64 {
        (ts as i128 * 1_000_000 * self.num as i128 / self.den as i128) as i64
    }

    /// Duration of a single tick in microseconds (one video frame for a
    /// per-frame timebase).
    pub fn tick_usec(&self) -> i64 {
        self.num as i64 * 1_000_000 / self.den as i64
    }

    pub fn to_seconds(&self, ts: i64) -> f64 {
        ts as f64 * self.num as f64 / self.den as f64
    }
}

/// A single encoded chunk received from an encoder.
///
/// Timestamps are in the producing encoder's timebase and may start at an
/// arbitrary value. The interleaver rebases them so that the first
/// dispatched packet pair lands near zero.
#[derive(Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub timebase: Timebase,
    pub kind: MediaKind,
    /// Audio track this packet belongs to. Resolved from the producing
    /// encoder on multi-track outputs; always 0 for video.
    pub track: usize,
    pub keyframe: bool,
    /// Drop priority; captions are only spliced into packets with
    /// priority <= 1 (keyframes and other high-priority frames).
    pub priority: u8,
    pub encoder: EncoderRef,
}

impl EncodedPacket {
    /// DTS rebased to microseconds.
    pub fn dts_usec(&self) -> i64 {
        self.timebase.to_usec(self.dts)
    }

    pub(crate) fn apply_offset(&mut self, offset: i64) {
        self.dts -= offset;
        self.pts -= offset;
    }
}

impl fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.data.len();
        let first_bytes = &self.data[0..usize::min(10, len)];
        f.debug_struct("EncodedPacket")
            .field("data", &format!("len={len}, {first_bytes:?}"))
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("timebase", &self.timebase)
            .field("kind", &self.kind)
            .field("track", &self.track)
            .field("keyframe", &self.keyframe)
            .finish()
    }
}

/// A raw video frame handed to non-encoded outputs.
#[derive(Clone)]
pub struct VideoFrameData {
    /// Monotonic capture timestamp in nanoseconds.
    pub timestamp: u64,
    pub data: Bytes,
}

impl fmt::Debug for VideoFrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrameData")
            .field("timestamp", &self.timestamp)
            .field("data", &format!("len={}", self.data.len()))
            .finish()
    }
}

/// A block of raw planar audio.
#[derive(Debug, Clone)]
pub struct AudioData {
    /// Monotonic timestamp of the first sample, in nanoseconds.
    pub timestamp: u64,
    pub frames: u32,
    pub planes: Vec<Bytes>,
}

/// Reason surfaced on the `stop` event. The core itself only produces
/// `Success` and `Disconnected`; everything else originates in a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StopCode {
    Success = 0,
    BadPath = -1,
    ConnectFailed = -2,
    InvalidStream = -3,
    Error = -4,
    Disconnected = -5,
    Unsupported = -6,
    NoSpace = -7,
    EncodeError = -8,
}

pub(crate) fn audio_frames_to_ns(sample_rate: u32, frames: u64) -> u64 {
    (frames as u128 * 1_000_000_000 / sample_rate as u128) as u64
}

pub(crate) fn ns_to_audio_frames(sample_rate: u32, ns: u64) -> u64 {
    (ns as u128 * sample_rate as u128 / 1_000_000_000) as u64
}
