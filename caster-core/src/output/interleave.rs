use itertools::Itertools;
use tracing::trace;

use crate::output::Output;
use crate::prelude::*;

/// Interleave buffer plus the startup-alignment bookkeeping that goes with
/// it. Everything in here is guarded by one mutex on the output; see the
/// lock-order notes on [`Output`].
#[derive(Default)]
pub(crate) struct InterleavedState {
    /// Ordered by `dts_usec` ascending, video before audio on ties.
    pub packets: Vec<EncodedPacket>,
    pub received_video: bool,
    pub received_audio: bool,
    pub highest_video_ts: i64,
    pub highest_audio_ts: i64,
    /// pts of the first dispatched video packet, in video timebase ticks.
    pub video_offset: i64,
    /// dts of the first dispatched audio packet per track, in ticks.
    pub audio_offsets: [i64; MAX_AUDIO_MIXES],
}

impl InterleavedState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn check_received(&mut self, packet: &EncodedPacket) {
        match packet.kind {
            MediaKind::Video => self.received_video = true,
            MediaKind::Audio => self.received_audio = true,
        }
    }

    /// Audio and video both need to start at timestamp 0 while the encoders
    /// may be anywhere on their own clocks when capture hooks up; the first
    /// packet's timestamp becomes the per-track baseline subtracted from
    /// everything that follows.
    fn apply_offset(&self, packet: &mut EncodedPacket) {
        let offset = match packet.kind {
            MediaKind::Video => self.video_offset,
            MediaKind::Audio => self.audio_offsets[packet.track],
        };
        packet.apply_offset(offset);
    }

    fn set_higher_ts(&mut self, kind: MediaKind, dts_usec: i64) {
        match kind {
            MediaKind::Video => self.highest_video_ts = self.highest_video_ts.max(dts_usec),
            MediaKind::Audio => self.highest_audio_ts = self.highest_audio_ts.max(dts_usec),
        }
    }

    /// A head packet may only leave once the opposing stream has moved past
    /// it; that is what keeps dispatched DTS monotonic per track.
    fn has_higher_opposing_ts(&self, packet: &EncodedPacket) -> bool {
        match packet.kind {
            MediaKind::Video => self.highest_audio_ts > packet.dts_usec(),
            MediaKind::Audio => self.highest_video_ts > packet.dts_usec(),
        }
    }

    fn insert_packet(&mut self, packet: EncodedPacket) {
        let dts_usec = packet.dts_usec();
        let idx = self
            .packets
            .iter()
            .position(|cur| {
                let cur_dts = cur.dts_usec();
                (dts_usec == cur_dts && packet.kind == MediaKind::Video) || dts_usec < cur_dts
            })
            .unwrap_or(self.packets.len());
        self.packets.insert(idx, packet);
    }

    fn resort(&mut self) {
        let old = std::mem::take(&mut self.packets);
        for packet in old {
            self.insert_packet(packet);
        }
    }

    fn find_first_idx(&self, kind: MediaKind, track: usize) -> Option<usize> {
        self.packets
            .iter()
            .position(|p| p.kind == kind && (kind == MediaKind::Video || p.track == track))
    }

    fn find_last_idx(&self, kind: MediaKind, track: usize) -> Option<usize> {
        self.packets
            .iter()
            .rposition(|p| p.kind == kind && (kind == MediaKind::Video || p.track == track))
    }

    fn discard_to_idx(&mut self, idx: usize) {
        self.packets.drain(0..idx);
    }

    /// Drops audio that was buffered ahead of the first keyframe; a decoder
    /// could not use it anyway.
    fn discard_unused_audio_packets(&mut self, dts_usec: i64) {
        let idx = self
            .packets
            .iter()
            .position(|p| p.dts_usec() >= dts_usec)
            .unwrap_or(self.packets.len());
        self.discard_to_idx(idx);
    }

    /// Index where the dispatched stream should start: the audio packet
    /// closest to the first video packet, clamped so video stays the
    /// leader.
    fn interleaved_start_idx(&self) -> usize {
        let Some(video_idx) = self.find_first_idx(MediaKind::Video, 0) else {
            return 0;
        };
        let first_video_dts = self.packets[video_idx].dts_usec();

        let idx = self
            .packets
            .iter()
            .positions(|packet| packet.kind == MediaKind::Audio)
            .min_by_key(|&i| (self.packets[i].dts_usec() - first_video_dts).abs())
            .unwrap_or(0);

        video_idx.min(idx)
    }

    /// When audio got buffered long before the first keyframe, everything
    /// up to and including the latest lagging head has to go. Returns the
    /// prune index, or None when a required track has no packet yet (the
    /// caller restarts the warm-up).
    fn prune_start_idx(&mut self, num_mixes: usize) -> Option<usize> {
        let Some(video_idx) = self.find_first_idx(MediaKind::Video, 0) else {
            self.received_video = false;
            return None;
        };

        let video = &self.packets[video_idx];
        let video_dts = video.dts_usec();
        let frame_duration_usec = video.timebase.tick_usec();

        let mut max_idx = video_idx;
        let mut max_diff = 0;
        for track in 0..num_mixes {
            let Some(audio_idx) = self.find_first_idx(MediaKind::Audio, track) else {
                self.received_audio = false;
                return None;
            };
            max_idx = max_idx.max(audio_idx);
            max_diff = max_diff.max(self.packets[audio_idx].dts_usec() - video_dts);
        }

        if max_diff > frame_duration_usec {
            Some(max_idx + 1)
        } else {
            Some(0)
        }
    }

    fn prune_packets(&mut self, num_mixes: usize) -> bool {
        let start_idx = match self.prune_start_idx(num_mixes) {
            None => return false,
            Some(0) => self.interleaved_start_idx(),
            Some(prune_start) => prune_start,
        };

        if start_idx > 0 {
            self.discard_to_idx(start_idx);
        }
        true
    }

    fn first_audio_and_video(&mut self, num_mixes: usize) -> Option<(usize, Vec<usize>)> {
        let video = self.find_first_idx(MediaKind::Video, 0);
        if video.is_none() {
            self.received_video = false;
        }

        let mut audio = Vec::with_capacity(num_mixes);
        for track in 0..num_mixes {
            match self.find_first_idx(MediaKind::Audio, track) {
                Some(idx) => audio.push(idx),
                None => {
                    self.received_audio = false;
                    return None;
                }
            }
        }

        video.map(|video| (video, audio))
    }

    /// One-shot startup alignment: pick matching first packets across all
    /// tracks, record the per-track offsets and rebase everything that is
    /// already buffered.
    fn initialize_packets(&mut self, num_mixes: usize) -> bool {
        let Some((video_idx, audio_idxs)) = self.first_audio_and_video(num_mixes) else {
            return false;
        };

        // ensure that there is audio past the first video packet
        let video_dts = self.packets[video_idx].dts_usec();
        for track in 0..num_mixes {
            let last = self.find_last_idx(MediaKind::Audio, track).unwrap();
            if self.packets[last].dts_usec() < video_dts {
                self.received_audio = false;
                return false;
            }
        }

        // clear out excess starting audio if it hasn't been already
        let start_idx = self.interleaved_start_idx();
        let (video_idx, audio_idxs) = if start_idx > 0 {
            self.discard_to_idx(start_idx);
            match self.first_audio_and_video(num_mixes) {
                Some(found) => found,
                None => return false,
            }
        } else {
            (video_idx, audio_idxs)
        };

        self.video_offset = self.packets[video_idx].pts;
        for (track, &audio_idx) in audio_idxs.iter().enumerate() {
            self.audio_offsets[track] = self.packets[audio_idx].dts;
        }

        // shift the running high-water marks into the rebased timeline
        if let Some(&first_audio) = audio_idxs.first() {
            self.highest_audio_ts -= self.packets[first_audio].dts_usec();
        }
        self.highest_video_ts -= self.packets[video_idx].dts_usec();

        let mut packets = std::mem::take(&mut self.packets);
        for packet in packets.iter_mut() {
            self.apply_offset(packet);
        }
        self.packets = packets;

        true
    }
}

impl Output {
    /// Receive path for outputs that carry both video and audio. Invoked
    /// from encoder worker threads (or the delay sink) with one packet at a
    /// time.
    pub(crate) fn interleave_packet(&self, mut packet: EncodedPacket) {
        if !self.active() {
            return;
        }

        if packet.kind == MediaKind::Audio {
            packet.track = self.audio_track_index(&packet.encoder);
        }
        let num_mixes = self.num_audio_mixes();

        let mut st = self.interleaved.lock().unwrap();

        // if first video frame is not a keyframe, discard until received
        if !st.received_video && packet.kind == MediaKind::Video && !packet.keyframe {
            trace!(dts_usec = packet.dts_usec(), "Discarding pre-keyframe video");
            st.discard_unused_audio_packets(packet.dts_usec());
            return;
        }

        let was_started = st.received_audio && st.received_video;

        if was_started {
            st.apply_offset(&mut packet);
        } else {
            st.check_received(&packet);
        }

        let (kind, dts_usec) = (packet.kind, packet.dts_usec());
        st.insert_packet(packet);
        st.set_higher_ts(kind, dts_usec);

        // when both video and audio have been received, we're ready to
        // start sending out packets (one at a time)
        if st.received_audio && st.received_video {
            if !was_started {
                if st.prune_packets(num_mixes)
                    && st.initialize_packets(num_mixes)
                {
                    st.resort();
                    self.send_interleaved(&mut st);
                }
            } else {
                self.send_interleaved(&mut st);
            }
        }
    }

    /// Pops the head packet if the opposing stream has overtaken it, runs
    /// caption injection on video, and hands the packet to the backend.
    pub(crate) fn send_interleaved(&self, st: &mut InterleavedState) {
        let Some(head) = st.packets.first() else {
            return;
        };
        if !st.has_higher_opposing_ts(head) {
            return;
        }

        let mut out = st.packets.remove(0);

        if out.kind == MediaKind::Video {
            self.count_video_frame();
            self.inject_captions(&mut out);
        }

        self.backend().encoded_packet(out);
    }

    pub(crate) fn reset_packet_data(&self) {
        self.interleaved.lock().unwrap().reset();
    }
}
