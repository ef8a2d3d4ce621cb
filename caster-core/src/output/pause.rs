use std::sync::{Mutex, MutexGuard};

use crate::host::HostClock;
use crate::types::{AudioData, audio_frames_to_ns, ns_to_audio_frames};

/// Running pause ledger.
///
/// Invariants: `ts_start == 0 && ts_end == 0` means not paused,
/// `ts_start > 0 && ts_end == 0` means currently paused. Closing a pause
/// sets `ts_end` and folds the interval into `ts_offset`, which is added
/// to every timestamp leaving the raw audio path so the backend clock
/// never sees the gap.
#[derive(Debug, Default)]
pub struct PauseLedger {
    data: Mutex<PauseData>,
}

#[derive(Debug, Default)]
pub(crate) struct PauseData {
    pub ts_start: u64,
    pub ts_end: u64,
    pub ts_offset: u64,
    pub last_video_ts: u64,
}

impl PauseData {
    pub fn can_start(&self) -> bool {
        self.ts_start == 0 && self.ts_end == 0
    }

    pub fn can_stop(&self) -> bool {
        self.ts_start != 0 && self.ts_end == 0
    }

    /// Idempotent; only the first call after a pause closes the window.
    pub fn end_pause(&mut self, ts: u64) {
        if self.ts_end == 0 {
            self.ts_end = ts;
            self.ts_offset += self.ts_end - self.ts_start;
        }
    }
}

/// Nearest future frame tick relative to the last seen video timestamp.
/// Pausing on a tick keeps audio and video pause boundaries symmetric.
pub(crate) fn closest_frame_ts(data: &PauseData, clock: &dyn HostClock) -> u64 {
    let interval = clock.video_frame_interval_ns();
    let i2 = interval * 2;
    let ts = clock.now_ns();

    data.last_video_ts + ((ts - data.last_video_ts + i2) / interval) * interval
}

impl PauseLedger {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PauseData> {
        self.data.lock().unwrap()
    }

    pub fn offset(&self) -> u64 {
        self.lock().ts_offset
    }

    pub(crate) fn last_video_ts(&self) -> u64 {
        self.lock().last_video_ts
    }

    pub(crate) fn reset(&self) {
        *self.lock() = PauseData::default();
    }

    /// Gate for raw video frames. Returns true if the frame falls inside a
    /// pause window and must be dropped. Clears the window once a frame at
    /// or past `ts_end` arrives.
    pub(crate) fn video_pause_check(&self, timestamp: u64) -> bool {
        let mut data = self.lock();
        let mut ignore_frame = false;

        if data.ts_start != 0 {
            if data.ts_end != 0 && timestamp >= data.ts_end {
                data.ts_start = 0;
                data.ts_end = 0;
            } else {
                ignore_frame = true;
            }
        }
        data.last_video_ts = timestamp;

        ignore_frame
    }

    /// Gate for raw audio blocks. Drops or trims samples that fall inside
    /// the pause window. Returns true if the whole block must be dropped.
    pub(crate) fn audio_pause_check(&self, audio: &mut AudioData, sample_rate: u32) -> bool {
        let mut data = self.lock();
        if data.ts_start == 0 {
            return false;
        }

        let end_ts = audio.timestamp + audio_frames_to_ns(sample_rate, audio.frames as u64);

        if end_ts <= data.ts_start {
            return false;
        }

        // still paused, or block ends inside the closed window
        if (data.ts_end == 0 || end_ts < data.ts_end) && audio.timestamp >= data.ts_start {
            return true;
        }

        if audio.timestamp < data.ts_start {
            // keep only the samples from before the pause boundary
            truncate_tail(audio, ns_to_audio_frames(sample_rate, data.ts_start - audio.timestamp));
            return audio.frames == 0;
        }

        // block reaches past the closed window; trim the paused lead-in
        let cutoff = data.ts_end.saturating_sub(audio.timestamp);
        trim_head(audio, ns_to_audio_frames(sample_rate, cutoff), sample_rate);
        data.ts_start = 0;
        data.ts_end = 0;

        audio.frames == 0
    }
}

fn truncate_tail(audio: &mut AudioData, keep_frames: u64) {
    let keep_frames = keep_frames.min(audio.frames as u64) as u32;
    if audio.frames == 0 {
        return;
    }
    for plane in audio.planes.iter_mut() {
        let bytes_per_frame = plane.len() / audio.frames as usize;
        *plane = plane.slice(0..keep_frames as usize * bytes_per_frame);
    }
    audio.frames = keep_frames;
}

fn trim_head(audio: &mut AudioData, cut_frames: u64, sample_rate: u32) {
    let cut_frames = cut_frames.min(audio.frames as u64) as u32;
    if audio.frames == 0 || cut_frames == 0 {
        return;
    }
    for plane in audio.planes.iter_mut() {
        let bytes_per_frame = plane.len() / audio.frames as usize;
        *plane = plane.slice(cut_frames as usize * bytes_per_frame..);
    }
    audio.timestamp += audio_frames_to_ns(sample_rate, cut_frames as u64);
    audio.frames -= cut_frames;
}
