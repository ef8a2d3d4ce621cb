use std::sync::Arc;

use crate::prelude::*;

pub type RawVideoCallback = Arc<dyn Fn(VideoFrameData) + Send + Sync>;
pub type RawAudioCallback = Arc<dyn Fn(usize, AudioData) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawVideoInfo {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAudioInfo {
    pub sample_rate: u32,
    pub channels: AudioChannels,
    /// Number of data planes per audio block (1 for interleaved formats).
    pub planes: usize,
    /// Bytes one sample frame occupies within a single plane.
    pub bytes_per_frame: usize,
}

/// Optional format override applied when connecting to a raw video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConversion {
    pub width: u32,
    pub height: u32,
}

/// Optional format override applied when connecting to a raw audio source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioConversion {
    pub sample_rate: Option<u32>,
    pub channels: Option<AudioChannels>,
}

/// A raw video producer (capture pipeline, compositor output, ...).
///
/// Connected callbacks are invoked once per frame from the producer's own
/// thread and must never block for long or panic.
pub trait RawVideoSource: Send + Sync + 'static {
    fn info(&self) -> RawVideoInfo;

    /// Frames produced since the source started; sampled when an output
    /// starts so dropped-frame percentages can be computed at stop time.
    fn total_frames(&self) -> u32 {
        0
    }

    fn connect(&self, conversion: Option<VideoConversion>, callback: RawVideoCallback);

    /// Disconnects a previously connected callback, matched by identity.
    fn disconnect(&self, callback: &RawVideoCallback);
}

/// A raw audio producer exposing up to [`MAX_AUDIO_MIXES`] mixes.
pub trait RawAudioSource: Send + Sync + 'static {
    fn info(&self) -> RawAudioInfo;

    fn connect(
        &self,
        mix_idx: usize,
        conversion: Option<AudioConversion>,
        callback: RawAudioCallback,
    );

    fn disconnect(&self, mix_idx: usize, callback: &RawAudioCallback);
}
