use std::collections::VecDeque;

use bytes::Bytes;

use crate::output::Output;
use crate::prelude::*;
use crate::types::{audio_frames_to_ns, ns_to_audio_frames};

/// Buffering state of the raw audio path: one byte ring per mix and plane,
/// plus the frame counters the emitted timestamps are derived from.
#[derive(Default)]
pub(crate) struct RawAudioState {
    pub sample_rate: u32,
    pub planes: usize,
    pub bytes_per_frame: usize,

    /// Timestamp of the video frame the audio timeline is anchored to.
    pub video_start_ts: u64,
    pub audio_start_ts: u64,
    pub total_audio_frames: u64,

    rings: Vec<Vec<VecDeque<u8>>>,
}

impl RawAudioState {
    /// Re-resolves the audio format and clears all buffered samples; runs
    /// every time data capture begins on a non-encoded output.
    pub fn reset(&mut self, info: Option<RawAudioInfo>, conversion: Option<AudioConversion>) {
        *self = Self::default();

        let Some(info) = info else {
            return;
        };
        self.sample_rate = info.sample_rate;
        self.planes = info.planes;
        self.bytes_per_frame = info.bytes_per_frame;
        if let Some(conversion) = conversion {
            if let Some(sample_rate) = conversion.sample_rate {
                self.sample_rate = sample_rate;
            }
            if let Some(channels) = conversion.channels {
                // planar layouts carry one plane per channel
                self.planes = self.planes.min(channels.count()).max(1);
            }
        }
        self.rings = (0..MAX_AUDIO_MIXES)
            .map(|_| (0..self.planes).map(|_| VecDeque::new()).collect())
            .collect();
    }

    fn push_block(&mut self, mix_idx: usize, audio: &AudioData) {
        for (plane_idx, plane) in audio.planes.iter().take(self.planes).enumerate() {
            self.rings[mix_idx][plane_idx].extend(plane.iter());
        }
    }

    fn has_full_block(&self, mix_idx: usize) -> bool {
        let block_bytes = AUDIO_OUTPUT_FRAMES * self.bytes_per_frame;
        !self.rings[mix_idx].is_empty() && self.rings[mix_idx][0].len() >= block_bytes
    }

    fn pop_block(&mut self, mix_idx: usize) -> Vec<Bytes> {
        let block_bytes = AUDIO_OUTPUT_FRAMES * self.bytes_per_frame;
        self.rings[mix_idx]
            .iter_mut()
            .map(|ring| ring.drain(0..block_bytes.min(ring.len())).collect::<Vec<u8>>())
            .map(Bytes::from)
            .collect()
    }
}

impl Output {
    /// Per-frame callback connected to the raw video source.
    pub(crate) fn raw_video_frame(&self, frame: VideoFrameData) {
        if self.pause.video_pause_check(frame.timestamp) {
            return;
        }

        if self.data_active() {
            self.backend().raw_video(frame);
        }
        self.count_video_frame();
    }

    /// Per-block callback connected to the raw audio source. Buffers the
    /// samples and emits fixed [`AUDIO_OUTPUT_FRAMES`]-frame blocks with
    /// timestamps derived from the running frame counter plus the pause
    /// ledger.
    pub(crate) fn raw_audio_block(&self, mix_idx: usize, audio: AudioData) {
        if !self.data_active() {
            return;
        }

        let mut raw = self.raw_audio.lock().unwrap();

        if raw.video_start_ts == 0 {
            raw.video_start_ts = self.pause.last_video_ts();
        }
        if raw.video_start_ts == 0 {
            return;
        }

        let Some(mut audio) = prepare_audio(&raw, audio) else {
            return;
        };
        if self.pause.audio_pause_check(&mut audio, raw.sample_rate) {
            return;
        }
        if raw.audio_start_ts == 0 {
            raw.audio_start_ts = audio.timestamp;
        }

        raw.push_block(mix_idx, &audio);

        while raw.has_full_block(mix_idx) {
            let planes = raw.pop_block(mix_idx);
            let timestamp = raw.audio_start_ts
                + audio_frames_to_ns(raw.sample_rate, raw.total_audio_frames)
                + self.pause.offset();
            raw.total_audio_frames += AUDIO_OUTPUT_FRAMES as u64;

            let block = AudioData {
                timestamp,
                frames: AUDIO_OUTPUT_FRAMES as u32,
                planes,
            };

            if self.backend().consumes_audio_mixes() {
                self.backend().raw_audio2(mix_idx, block);
            } else {
                self.backend().raw_audio(block);
            }
        }
    }
}

/// Audio arriving before the anchoring video frame is unusable; drop whole
/// blocks from before `video_start_ts` and trim the leading samples of a
/// block straddling it.
fn prepare_audio(raw: &RawAudioState, audio: AudioData) -> Option<AudioData> {
    if audio.timestamp >= raw.video_start_ts {
        return Some(audio);
    }

    let duration = audio_frames_to_ns(raw.sample_rate, audio.frames as u64);
    let end_ts = audio.timestamp + duration;
    if end_ts <= raw.video_start_ts {
        return None;
    }

    let cutoff_ns = raw.video_start_ts - audio.timestamp;
    let cutoff_frames = ns_to_audio_frames(raw.sample_rate, cutoff_ns).min(audio.frames as u64);

    let mut out = audio;
    out.timestamp += cutoff_ns;
    out.frames -= cutoff_frames as u32;
    for plane in out.planes.iter_mut() {
        let cut = (cutoff_frames as usize * raw.bytes_per_frame).min(plane.len());
        *plane = plane.slice(cut..);
    }
    Some(out)
}
