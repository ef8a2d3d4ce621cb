use std::sync::{Mutex, atomic::Ordering};
use std::time::{Duration, Instant};

use super::reconnect::{RECONNECT_RETRY_BASE_EXP, RECONNECT_RETRY_MAX_MSEC, next_retry_msec};
use super::test_support::*;
use crate::output::delay::{DelayFlags, DelaySink};
use crate::prelude::*;

fn wait_for_event(
    events: &crossbeam_channel::Receiver<Event>,
    mut predicate: impl FnMut(&Event) -> bool,
) -> Event {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        let event = events.recv_timeout(remaining).expect("event bus closed");
        if predicate(&event) {
            return event;
        }
    }
}

#[test]
fn test_start_stop_lifecycle() {
    let fixture = EncodedFixture::start(1);
    assert!(fixture.video.active());
    assert!(fixture.audio[0].active());

    let events = fixture.drain_events();
    assert!(events.iter().any(|e| matches!(e, Event::OutputActivate(_))));
    assert!(events.iter().any(|e| matches!(e, Event::OutputStart(_))));

    fixture.output.stop();
    fixture.output.stopping_event.wait();
    fixture.output.join_end_capture_thread();

    assert!(!fixture.output.active());
    assert!(!fixture.video.active());
    assert!(!fixture.audio[0].active());

    let events = fixture.drain_events();
    assert!(events.iter().any(|e| matches!(e, Event::OutputStopping(_))));
    assert!(events.iter().any(|e| matches!(e, Event::OutputDeactivate(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::OutputStop {
            code: StopCode::Success,
            ..
        }
    )));

    // stop passed the host clock's timestamp to the backend
    assert_eq!(fixture.backend.stop_ts.lock().unwrap().len(), 1);
}

#[test]
fn test_start_requires_encoders() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let backend = MockBackend::encoded_av();
    let output = Output::new(&ctx, OutputId::from("no-encoders"), backend.clone());

    // backend connects, but capture cannot begin without encoders
    assert!(!output.start());
    assert!(!output.active());
}

#[test]
fn test_encoder_config_errors() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let backend = MockBackend::encoded_av();
    let output = Output::new(&ctx, OutputId::from("config"), backend);

    let video = video_encoder_30fps("venc");
    let audio = audio_encoder_usec("aenc");

    assert!(matches!(
        output.set_video_encoder(audio.clone()),
        Err(OutputConfigError::EncoderKindMismatch { .. }),
    ));
    assert!(matches!(
        output.set_audio_encoder(video.clone(), 0),
        Err(OutputConfigError::EncoderKindMismatch { .. }),
    ));
    assert!(matches!(
        output.set_audio_encoder(audio.clone(), MAX_AUDIO_MIXES),
        Err(OutputConfigError::TrackOutOfRange(_)),
    ));
    // single-track backend only owns track 0
    assert!(matches!(
        output.set_audio_encoder(audio.clone(), 1),
        Err(OutputConfigError::NotMultiTrack(_)),
    ));

    assert!(output.set_video_encoder(video).is_ok());
    assert!(output.set_audio_encoder(audio, 0).is_ok());
}

#[test]
fn test_encoder_init_failure_propagates_last_error() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let backend = MockBackend::encoded_av();
    let output = Output::new(&ctx, OutputId::from("bad-encoder"), backend);

    let failing = StubEncoderBackend::default();
    failing.fail_initialize.store(true, Ordering::Release);
    *failing.error.lock().unwrap() = Some("x264 refused settings".into());
    let video = Encoder::new(
        "venc",
        MediaKind::Video,
        Timebase { num: 1, den: 30 },
        Box::new(failing),
    );
    output.set_video_encoder(video).unwrap();
    output
        .set_audio_encoder(audio_encoder_usec("aenc"), 0)
        .unwrap();

    assert!(!output.start());
    assert_eq!(
        output.last_error().as_deref(),
        Some("x264 refused settings"),
    );
}

#[test]
fn test_last_error_falls_back_to_encoders() {
    let fixture = EncodedFixture::start(1);
    assert_eq!(fixture.output.last_error(), None);

    // encoder-side error surfaces through the output
    let failing = StubEncoderBackend::default();
    *failing.error.lock().unwrap() = Some("aac overload".into());
    let audio = Encoder::new(
        "aenc2",
        MediaKind::Audio,
        Timebase {
            num: 1,
            den: 1_000_000,
        },
        Box::new(failing),
    );
    fixture.output.stop();
    fixture.output.stopping_event.wait();
    fixture.output.set_audio_encoder(audio, 0).unwrap();
    assert_eq!(fixture.output.last_error().as_deref(), Some("aac overload"));

    // the output's own error wins over encoder errors
    fixture.output.set_last_error(Some("endpoint rejected key".into()));
    assert_eq!(
        fixture.output.last_error().as_deref(),
        Some("endpoint rejected key"),
    );
}

#[test]
fn test_encoders_are_paired_for_startup() {
    let fixture = EncodedFixture::start(1);
    assert!(fixture.audio[0].wait_for_video());
    let paired = fixture.audio[0].paired_encoder().unwrap();
    assert_eq!(paired.name(), fixture.video.name());
    assert!(fixture.video.paired_encoder().is_some());

    // unpairing happens when capture stops
    fixture.output.stop();
    fixture.output.stopping_event.wait();
    fixture.output.join_end_capture_thread();
    assert!(!fixture.audio[0].wait_for_video());
    assert!(fixture.video.paired_encoder().is_none());
}

#[test]
fn test_backoff_schedule() {
    assert_eq!(next_retry_msec(2000, 1.5), 3000);
    assert_eq!(next_retry_msec(3000, 1.5), 4500);
    assert_eq!(
        next_retry_msec(RECONNECT_RETRY_MAX_MSEC, 1.5),
        RECONNECT_RETRY_MAX_MSEC,
    );

    let fixture = EncodedFixture::start(1);
    let exp = fixture.output.reconnect.retry_exp;
    assert!((RECONNECT_RETRY_BASE_EXP..RECONNECT_RETRY_BASE_EXP + 0.05).contains(&exp));
}

#[test]
fn test_reconnect_exhaustion_emits_disconnected_stop() {
    let fixture = EncodedFixture::start(1);
    fixture.output.set_reconnect_settings(3, 0);
    fixture.drain_events();

    // every retry comes up and immediately drops the connection
    fixture
        .backend
        .async_connect_fail
        .store(true, Ordering::Release);
    fixture.backend.handle().signal_stop(StopCode::Disconnected);

    let stop = wait_for_event(&fixture.events, |event| {
        matches!(event, Event::OutputStop { .. })
    });
    let Event::OutputStop { code, .. } = stop else {
        unreachable!();
    };
    assert_eq!(code, StopCode::Disconnected);

    // the initial start plus one per retry
    assert!(fixture.backend.start_calls.load(Ordering::Acquire) >= 3);
    assert!(!fixture.output.reconnecting());
}

#[test]
fn test_reconnect_success_after_recovery() {
    let fixture = EncodedFixture::start(1);
    // one second of back-off leaves the teardown worker time to finish
    // before the retry hooks the encoders again
    fixture.output.set_reconnect_settings(5, 1);
    fixture.drain_events();

    // first attempt succeeds again: backend auto-begins data capture
    fixture.backend.handle().signal_stop(StopCode::Disconnected);

    wait_for_event(&fixture.events, |event| {
        matches!(event, Event::OutputReconnectSuccess(_))
    });
    assert!(!fixture.output.reconnecting());

    // wait for activation to settle, then confirm the output is usable
    let deadline = Instant::now() + Duration::from_secs(5);
    while !fixture.output.active() {
        assert!(Instant::now() < deadline, "output never reactivated");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_pause_is_all_or_nothing_across_encoders() {
    let fixture = EncodedFixture::start(1);
    fixture.clock.set_ns(100 * 33333333);

    // one encoder mid-pause blocks the group
    fixture.audio[0].pause.lock().ts_start = 12345;
    assert!(!fixture.output.pause(true));
    assert!(!fixture.output.paused());
    assert!(!fixture.video.paused());
    assert_eq!(fixture.video.pause.lock().ts_start, 0);

    // with every ledger clean the group pauses on one shared tick
    fixture.audio[0].pause.lock().ts_start = 0;
    assert!(fixture.output.pause(true));
    assert!(fixture.output.paused());
    assert!(fixture.video.paused());
    assert!(fixture.audio[0].paused());
    let video_start = fixture.video.pause.lock().ts_start;
    let audio_start = fixture.audio[0].pause.lock().ts_start;
    assert_eq!(video_start, audio_start);
    assert_ne!(video_start, 0);

    // unpause closes both ledgers at the same tick
    fixture.clock.set_ns(130 * 33333333);
    assert!(fixture.output.pause(false));
    assert_eq!(fixture.video.pause_offset(), fixture.audio[0].pause_offset());
    assert_ne!(fixture.video.pause_offset(), 0);
}

#[test]
fn test_pause_requires_capability_and_active_state() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let mut flags = MockBackend::encoded_av().flags();
    flags.can_pause = false;
    let backend = MockBackend::new(flags);
    let output = Output::new(&ctx, OutputId::from("no-pause"), backend);
    assert!(!output.pause(true));

    let fixture = EncodedFixture::start(1);
    fixture.output.stop();
    fixture.output.stopping_event.wait();
    assert!(!fixture.output.pause(true));
}

struct RecordingDelaySink {
    handle: OutputHandle,
    held: Mutex<Vec<EncodedPacket>>,
    flushed: std::sync::atomic::AtomicU32,
}

impl DelaySink for RecordingDelaySink {
    fn process(&self, packet: EncodedPacket) {
        self.held.lock().unwrap().push(packet);
    }

    fn delay_start(&self) -> bool {
        self.handle.delayed_start()
    }

    fn delay_stop(&self) {
        self.handle.delayed_stop(0);
    }

    fn flush(&self) {
        self.held.lock().unwrap().clear();
        self.flushed
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

#[test]
fn test_delay_shim_routes_packets_through_sink() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let backend = MockBackend::encoded_av();
    let output = Output::new(&ctx, OutputId::from("delayed"), backend.clone());

    let video = video_encoder_30fps("venc");
    let audio = audio_encoder_usec("aenc");
    output.set_video_encoder(video.clone()).unwrap();
    output.set_audio_encoder(audio.clone(), 0).unwrap();
    output.set_delay(2, DelayFlags { preserve: true });

    let sink = std::sync::Arc::new(RecordingDelaySink {
        handle: output.handle(),
        held: Mutex::new(Vec::new()),
        flushed: std::sync::atomic::AtomicU32::new(0),
    });
    output.set_delay_sink(sink.clone());

    assert!(output.start());
    assert!(output.active());
    assert!(output.delay_active());
    assert_eq!(output.active_delay_ns(), 2_000_000_000);

    // packets divert into the sink instead of the backend
    video.submit_packet(payload(32), 0, 0, true, 0);
    audio.submit_packet(payload(8), 0, 0, false, 3);
    audio.submit_packet(payload(8), 50000, 50000, false, 3);
    assert_eq!(sink.held.lock().unwrap().len(), 3);
    assert!(backend.packets.lock().unwrap().is_empty());

    // packets returning from the buffer take the real dispatch path
    let held = std::mem::take(&mut *sink.held.lock().unwrap());
    for packet in held {
        output.handle().delayed_packet(packet);
    }
    assert!(!backend.packets.lock().unwrap().is_empty());

    // force stop drops whatever the buffer still holds
    output.force_stop();
    output.stopping_event.wait();
    assert!(sink.flushed.load(std::sync::atomic::Ordering::Acquire) >= 1);
    assert!(!output.delay_active());
}

#[test]
fn test_destroy_joins_all_workers() {
    let fixture = EncodedFixture::start(1);
    fixture.output.destroy();

    assert!(!fixture.output.active());
    assert!(fixture.output.stopping_event.is_set());
    assert!(fixture.ctx.output_by_id(&OutputId::from("test-output")).is_none());

    // lifecycle calls after destroy are inert
    assert!(!fixture.output.start());

    // producers are detached and their packets go nowhere
    fixture.submit_video(0, true);
    fixture.submit_audio(0, 0);
    assert!(fixture.backend.packets.lock().unwrap().is_empty());
}

#[test]
fn test_congestion_is_clamped() {
    let fixture = EncodedFixture::start(1);
    // mock backend reports 0.0; the clamp keeps the value in range
    let congestion = fixture.output.congestion();
    assert!((0.0..=1.0).contains(&congestion));
}

#[test]
fn test_registry_lookup() {
    let clock = TestClock::new(Framerate { num: 30, den: 1 });
    let ctx = OutputCtx::new(clock);
    let backend = MockBackend::encoded_av();
    let output = Output::new(&ctx, OutputId::from("registered"), backend);

    assert!(ctx.output_by_id(&OutputId::from("registered")).is_some());
    assert_eq!(ctx.outputs().len(), 1);
    output.destroy();
    assert!(ctx.output_by_id(&OutputId::from("registered")).is_none());
}
