use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::debug;

use crate::error::CaptionError;
use crate::output::Output;
use crate::prelude::*;

use self::cea708::{Cea708Frame, eia608_encode_line, eia608_parity_verify, render_sei};

pub(crate) mod cea708;

const NAL_START: [u8; 4] = [0, 0, 0, 1];
const DEFAULT_DISPLAY_DURATION: f64 = 2.0;

/// Both caption queues plus their pacing state, guarded by one mutex.
#[derive(Default)]
pub(crate) struct CaptionState {
    /// Text lines rendered through the CEA-608 frame builder.
    lines: VecDeque<CaptionText>,
    /// Earliest frame timestamp (seconds) the next queued line may be
    /// spliced into; advanced by each line's display duration.
    caption_timestamp: f64,
    /// Raw CEA-708 cc_data tuples, drained wholesale per keyframe.
    data: VecDeque<[u8; 3]>,
    last_raw_caption_ts: f64,
}

struct CaptionText {
    text: String,
    display_duration: f64,
}

impl Output {
    /// Queues a text caption with the default two second display duration.
    pub fn push_caption_text(&self, text: &str) {
        self.push_caption_text_with_duration(text, DEFAULT_DISPLAY_DURATION)
    }

    /// Queues a text caption. Text longer than [`CAPTION_LINE_BYTES`] is
    /// split into multiple lines, each displayed for `display_duration`
    /// seconds.
    pub fn push_caption_text_with_duration(&self, text: &str, display_duration: f64) {
        if !self.active() {
            return;
        }
        debug!(output_id = %self.id(), text, "Caption text");

        let mut captions = self.captions.lock().unwrap();
        let mut rest = text;
        loop {
            let split = caption_line_split(rest);
            captions.lines.push_back(CaptionText {
                text: rest[..split].to_string(),
                display_duration,
            });
            if split == rest.len() {
                break;
            }
            rest = &rest[split..];
        }
    }

    /// Queues raw CEA-708 cc_data tuples (3 bytes each) for injection into
    /// the next eligible video packet.
    pub fn push_caption_data(&self, data: &[u8]) -> Result<(), CaptionError> {
        if data.len() % 3 != 0 {
            return Err(CaptionError::UnalignedData(data.len()));
        }
        let mut captions = self.captions.lock().unwrap();
        for tuple in data.chunks_exact(3) {
            captions.data.push_back([tuple[0], tuple[1], tuple[2]]);
        }
        Ok(())
    }

    /// Splices pending captions into a video packet that is about to be
    /// dispatched. Called with the interleave lock held; takes the caption
    /// lock.
    pub(crate) fn inject_captions(&self, packet: &mut EncodedPacket) {
        let mut captions = self.captions.lock().unwrap();

        let frame_timestamp = packet.timebase.to_seconds(packet.pts);

        if let Some(head) = captions.lines.front()
            && captions.caption_timestamp <= frame_timestamp
        {
            debug!(frame_timestamp, text = %head.text, "Sending caption");
            let display_duration = head.display_duration;
            if add_caption(&mut captions, packet) {
                captions.caption_timestamp = frame_timestamp + display_duration;
            }
        }

        if !captions.data.is_empty() && captions.last_raw_caption_ts < frame_timestamp {
            captions.last_raw_caption_ts = frame_timestamp;
            add_caption(&mut captions, packet);
        }
    }

    /// Drops pending raw caption data and resets pacing; runs on every
    /// (re)start so stale captions never leak into a new session.
    pub(crate) fn reset_caption_data(&self) {
        let mut captions = self.captions.lock().unwrap();
        captions.data.clear();
        captions.caption_timestamp = 0.0;
        captions.last_raw_caption_ts = 0.0;
    }

    pub(crate) fn clear_caption_lines(&self) {
        self.captions.lock().unwrap().lines.clear();
    }
}

/// Renders queued captions into a single t35 SEI message and rewraps the
/// packet as `payload || start code || SEI`.
///
/// The raw byte queue takes precedence over queued lines. Tuples that are
/// not CEA-608 field 0, padding words (0x8080), zero words, or words that
/// fail the odd-parity check are discarded.
fn add_caption(captions: &mut CaptionState, out: &mut EncodedPacket) -> bool {
    if out.priority > 1 {
        return false;
    }

    let mut frame = Cea708Frame::new();

    if !captions.data.is_empty() {
        while let Some(tuple) = captions.data.pop_front() {
            let field = tuple[0] & 0x03;
            if field != 0 {
                // only send cea 608
                continue;
            }

            let word = u16::from_be_bytes([tuple[1], tuple[2]]);
            if word == 0x8080 || word == 0 {
                continue;
            }
            if !eia608_parity_verify(word) {
                continue;
            }

            frame.add_cc_data(true, field, word);
        }
    } else if let Some(line) = captions.lines.pop_front() {
        for word in eia608_encode_line(&line.text) {
            frame.add_cc_data(true, 0, word);
        }
    } else {
        return false;
    }

    if frame.is_empty() {
        return false;
    }

    let sei = render_sei(&frame.render_t35());

    // The SEI ought to precede the first VCL NAL; downstream muxers
    // tolerate it appended after the frame payload, so it goes at the end.
    let mut data = BytesMut::with_capacity(out.data.len() + NAL_START.len() + sei.len());
    data.extend_from_slice(&out.data);
    data.extend_from_slice(&NAL_START);
    data.extend_from_slice(&sei);
    out.data = data.freeze();

    true
}

/// Largest prefix of at most [`CAPTION_LINE_BYTES`] bytes that ends on a
/// char boundary.
fn caption_line_split(text: &str) -> usize {
    if text.len() <= CAPTION_LINE_BYTES {
        return text.len();
    }
    let mut split = CAPTION_LINE_BYTES;
    while split > 0 && !text.is_char_boundary(split) {
        split -= 1;
    }
    if split == 0 {
        // first char is wider than the line budget; take it whole
        split = text.chars().next().map(char::len_utf8).unwrap_or(0);
    }
    split
}

#[cfg(test)]
mod caption_tests;
