use super::*;
use crate::output::test_support::{EncodedFixture, payload};
use crate::prelude::*;

const NAL_START_SEI: [u8; 6] = [0, 0, 0, 1, 0x06, 0x04];

fn video_packet(priority: u8) -> EncodedPacket {
    EncodedPacket {
        data: payload(32),
        pts: 0,
        dts: 0,
        timebase: Timebase { num: 1, den: 30 },
        kind: MediaKind::Video,
        track: 0,
        keyframe: true,
        priority,
        encoder: EncoderRef::none(),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn test_add_caption_splices_sei_after_payload() {
    let mut captions = CaptionState::default();
    captions.lines.push_back(CaptionText {
        text: "HELLO".to_string(),
        display_duration: 2.0,
    });

    let original = payload(32);
    let mut packet = video_packet(0);

    assert!(add_caption(&mut captions, &mut packet));
    assert!(packet.data.starts_with(&original));
    assert!(contains(&packet.data, &NAL_START_SEI));
    assert!(contains(&packet.data, b"GA94"));
    // 'H' with odd parity applied
    assert!(contains(&packet.data, &[0xFC, 0xC8]));
    assert!(captions.lines.is_empty());
}

#[test]
fn test_add_caption_skips_low_priority_frames() {
    let mut captions = CaptionState::default();
    captions.lines.push_back(CaptionText {
        text: "HELLO".to_string(),
        display_duration: 2.0,
    });

    let mut packet = video_packet(2);
    assert!(!add_caption(&mut captions, &mut packet));
    assert_eq!(packet.data.len(), 32);
    // the line stays queued for the next eligible frame
    assert_eq!(captions.lines.len(), 1);
}

#[test]
fn test_raw_tuple_filtering() {
    let mut captions = CaptionState::default();
    // field 1: skipped
    captions.data.push_back([0x01, 0xC1, 0xC2]);
    // padding: skipped
    captions.data.push_back([0x00, 0x80, 0x80]);
    // zero word: skipped
    captions.data.push_back([0x00, 0x00, 0x00]);
    // bad parity: skipped
    captions.data.push_back([0x00, 0x41, 0x48]);
    // valid CEA-608 field 0 pair
    captions.data.push_back([0x00, 0xC1, 0xC8]);

    let mut packet = video_packet(0);
    assert!(add_caption(&mut captions, &mut packet));
    assert!(captions.data.is_empty());

    let sei = &packet.data[32..];
    // exactly one cc_data tuple survived the filters
    let header_idx = sei
        .windows(5)
        .position(|window| &window[0..4] == b"GA94" && window[4] == 0x03)
        .unwrap();
    assert_eq!(sei[header_idx + 5], 0x40 | 1);
    assert!(contains(sei, &[0xFC, 0xC1, 0xC8]));
}

#[test]
fn test_add_caption_with_nothing_queued() {
    let mut captions = CaptionState::default();
    let mut packet = video_packet(0);
    assert!(!add_caption(&mut captions, &mut packet));
    assert_eq!(packet.data.len(), 32);
}

#[test]
fn test_caption_line_split_respects_budget() {
    assert_eq!(caption_line_split("short"), 5);
    let long = "x".repeat(CAPTION_LINE_BYTES + 10);
    assert_eq!(caption_line_split(&long), CAPTION_LINE_BYTES);
}

#[test]
fn test_push_caption_text_splits_long_lines() {
    let fixture = EncodedFixture::start(1);
    let long = "A".repeat(CAPTION_LINE_BYTES * 2 + 5);
    fixture.output.push_caption_text(&long);

    let captions = fixture.output.captions.lock().unwrap();
    assert_eq!(captions.lines.len(), 3);
    assert!(captions.lines.iter().all(|l| l.text.len() <= CAPTION_LINE_BYTES));
}

#[test]
fn test_push_caption_data_requires_whole_tuples() {
    let fixture = EncodedFixture::start(1);
    assert!(fixture.output.push_caption_data(&[0x00, 0xC1]).is_err());
    assert!(fixture.output.push_caption_data(&[0x00, 0xC1, 0xC8]).is_ok());
}

/// End to end: a queued line rides the first keyframe, and no frame inside
/// the display window carries another caption.
#[test]
fn test_caption_injection_and_dedupe_window() {
    let fixture = EncodedFixture::start(1);
    fixture.output.push_caption_text("HELLO");
    fixture.output.push_caption_text("WORLD");

    fixture.submit_video(0, true);
    fixture.submit_audio(0, 0);
    fixture.submit_audio(0, 33334);
    // keyframes at 1.0 s and just under 2.0 s, then one past the window
    for tick in [30i64, 59, 60] {
        fixture.submit_video(tick, true);
        fixture.submit_audio(0, (tick + 3) * 33333);
    }

    let packets = fixture.backend.packets.lock().unwrap();
    let videos = packets
        .iter()
        .filter(|p| p.kind == MediaKind::Video)
        .collect::<Vec<_>>();
    assert_eq!(videos.len(), 4);

    for video in &videos {
        let captioned = contains(&video.data, b"GA94");
        match video.pts {
            // the first keyframe carries HELLO, the first one at or past
            // pts 60 (2.0 s) carries WORLD
            0 | 60 => {
                assert!(captioned, "caption missing at pts {}", video.pts);
                assert!(contains(&video.data, &NAL_START_SEI));
            }
            _ => assert!(
                !captioned,
                "caption leaked into the display window at pts {}",
                video.pts,
            ),
        }
    }
}
