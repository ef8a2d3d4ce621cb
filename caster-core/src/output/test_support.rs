//! Shared fakes for the output test modules: a controllable clock, a
//! recording backend, stub encoders and raw sources.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use bytes::Bytes;

use crate::prelude::*;

pub(crate) struct TestClock {
    now_ns: AtomicU64,
    frame_interval_ns: u64,
}

impl TestClock {
    pub fn new(framerate: Framerate) -> Arc<Self> {
        Arc::new(Self {
            now_ns: AtomicU64::new(0),
            frame_interval_ns: framerate.frame_interval().as_nanos() as u64,
        })
    }

    pub fn set_ns(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }
}

impl HostClock for TestClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    fn video_frame_interval_ns(&self) -> u64 {
        self.frame_interval_ns
    }
}

/// Backend fake: records everything it receives and drives the
/// begin/end-data-capture protocol the way a real plug-in would.
pub(crate) struct MockBackend {
    flags: OutputFlags,
    consumes_mixes: bool,
    pub handle: Mutex<Option<OutputHandle>>,
    pub start_calls: AtomicU32,
    pub start_result: AtomicBool,
    /// Simulate a connection that comes up and immediately drops: `start`
    /// succeeds but a worker reports `ConnectFailed` shortly after.
    pub async_connect_fail: AtomicBool,
    pub packets: Mutex<Vec<EncodedPacket>>,
    pub raw_video_frames: Mutex<Vec<VideoFrameData>>,
    pub raw_audio_blocks: Mutex<Vec<(usize, AudioData)>>,
    pub stop_ts: Mutex<Vec<u64>>,
}

impl MockBackend {
    pub fn encoded_av() -> Arc<Self> {
        Self::new(OutputFlags {
            video: true,
            audio: true,
            encoded: true,
            service: false,
            multi_track: false,
            can_pause: true,
            force_encoder: false,
        })
    }

    pub fn raw_av() -> Arc<Self> {
        Self::new(OutputFlags {
            video: true,
            audio: true,
            encoded: false,
            service: false,
            multi_track: false,
            can_pause: true,
            force_encoder: false,
        })
    }

    pub fn new(flags: OutputFlags) -> Arc<Self> {
        Self::build(flags, false)
    }

    pub fn multi_mix(flags: OutputFlags) -> Arc<Self> {
        Self::build(flags, true)
    }

    fn build(flags: OutputFlags, consumes_mixes: bool) -> Arc<Self> {
        Arc::new(Self {
            flags,
            consumes_mixes,
            handle: Mutex::new(None),
            start_calls: AtomicU32::new(0),
            start_result: AtomicBool::new(true),
            async_connect_fail: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            raw_video_frames: Mutex::new(Vec::new()),
            raw_audio_blocks: Mutex::new(Vec::new()),
            stop_ts: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> OutputHandle {
        self.handle.lock().unwrap().clone().expect("backend attached")
    }

    pub fn packet_summaries(&self) -> Vec<(MediaKind, i64)> {
        self.packets
            .lock()
            .unwrap()
            .iter()
            .map(|packet| (packet.kind, packet.dts_usec()))
            .collect()
    }
}

impl OutputBackend for MockBackend {
    fn id(&self) -> &str {
        "mock_output"
    }

    fn flags(&self) -> OutputFlags {
        self.flags
    }

    fn attach(&self, handle: OutputHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn start(&self) -> bool {
        self.start_calls.fetch_add(1, Ordering::AcqRel);
        if !self.start_result.load(Ordering::Acquire) {
            return false;
        }
        let handle = self.handle();
        if self.async_connect_fail.load(Ordering::Acquire) {
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                handle.signal_stop(StopCode::ConnectFailed);
            });
            return true;
        }
        if self.flags.encoded && !handle.initialize_encoders() {
            return false;
        }
        handle.begin_data_capture()
    }

    fn stop(&self, ts: u64) {
        self.stop_ts.lock().unwrap().push(ts);
        self.handle().end_data_capture();
    }

    fn encoded_packet(&self, packet: EncodedPacket) {
        self.packets.lock().unwrap().push(packet);
    }

    fn raw_video(&self, frame: VideoFrameData) {
        self.raw_video_frames.lock().unwrap().push(frame);
    }

    fn raw_audio(&self, audio: AudioData) {
        self.raw_audio_blocks.lock().unwrap().push((0, audio));
    }

    fn raw_audio2(&self, mix_idx: usize, audio: AudioData) {
        self.raw_audio_blocks.lock().unwrap().push((mix_idx, audio));
    }

    fn consumes_audio_mixes(&self) -> bool {
        self.consumes_mixes
    }
}

#[derive(Default)]
pub(crate) struct StubEncoderBackend {
    pub fail_initialize: AtomicBool,
    pub error: Mutex<Option<Arc<str>>>,
}

impl EncoderBackend for StubEncoderBackend {
    fn initialize(&self) -> bool {
        !self.fail_initialize.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Option<Arc<str>> {
        self.error.lock().unwrap().clone()
    }
}

pub(crate) fn video_encoder_30fps(name: &str) -> Arc<Encoder> {
    Encoder::new(
        name,
        MediaKind::Video,
        Timebase { num: 1, den: 30 },
        Box::new(StubEncoderBackend::default()),
    )
}

/// Microsecond timebase keeps test timestamps readable: one tick == 1 us.
pub(crate) fn audio_encoder_usec(name: &str) -> Arc<Encoder> {
    Encoder::new(
        name,
        MediaKind::Audio,
        Timebase {
            num: 1,
            den: 1_000_000,
        },
        Box::new(StubEncoderBackend::default()),
    )
}

pub(crate) fn payload(len: usize) -> Bytes {
    Bytes::from(vec![0xAB; len])
}

pub(crate) struct StubVideoSource {
    pub callbacks: Mutex<Vec<RawVideoCallback>>,
}

impl StubVideoSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn push_frame(&self, timestamp: u64) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(VideoFrameData {
                timestamp,
                data: payload(16),
            });
        }
    }
}

impl RawVideoSource for StubVideoSource {
    fn info(&self) -> RawVideoInfo {
        RawVideoInfo {
            width: 1280,
            height: 720,
        }
    }

    fn connect(&self, _conversion: Option<VideoConversion>, callback: RawVideoCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    fn disconnect(&self, callback: &RawVideoCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }
}

pub(crate) struct StubAudioSource {
    info: RawAudioInfo,
    pub callbacks: Mutex<Vec<(usize, RawAudioCallback)>>,
}

impl StubAudioSource {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            info: RawAudioInfo {
                sample_rate,
                channels: AudioChannels::Mono,
                planes: 1,
                bytes_per_frame: 4,
            },
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn push_block(&self, timestamp: u64, frames: u32) {
        let block = AudioData {
            timestamp,
            frames,
            planes: vec![payload(frames as usize * self.info.bytes_per_frame)],
        };
        let callbacks = self.callbacks.lock().unwrap().clone();
        for (mix_idx, callback) in callbacks {
            callback(mix_idx, block.clone());
        }
    }
}

impl RawAudioSource for StubAudioSource {
    fn info(&self) -> RawAudioInfo {
        self.info
    }

    fn connect(
        &self,
        mix_idx: usize,
        _conversion: Option<AudioConversion>,
        callback: RawAudioCallback,
    ) {
        self.callbacks.lock().unwrap().push((mix_idx, callback));
    }

    fn disconnect(&self, mix_idx: usize, callback: &RawAudioCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .retain(|(existing_idx, existing)| {
                *existing_idx != mix_idx || !Arc::ptr_eq(existing, callback)
            });
    }
}

/// Encoded A/V output wired to stub encoders, already started.
pub(crate) struct EncodedFixture {
    pub ctx: Arc<OutputCtx>,
    pub clock: Arc<TestClock>,
    pub backend: Arc<MockBackend>,
    pub output: Arc<Output>,
    pub video: Arc<Encoder>,
    pub audio: Vec<Arc<Encoder>>,
    pub events: crossbeam_channel::Receiver<Event>,
}

impl EncodedFixture {
    pub fn start(audio_tracks: usize) -> Self {
        let clock = TestClock::new(Framerate { num: 30, den: 1 });
        let ctx = OutputCtx::new(clock.clone());
        let events = ctx.event_emitter.subscribe();

        let mut flags = MockBackend::encoded_av().flags();
        flags.multi_track = audio_tracks > 1;
        let backend = MockBackend::new(flags);

        let output = Output::new(&ctx, OutputId::from("test-output"), backend.clone());
        let video = video_encoder_30fps("venc");
        output.set_video_encoder(video.clone()).unwrap();

        let audio = (0..audio_tracks)
            .map(|idx| {
                let encoder = audio_encoder_usec(&format!("aenc-{idx}"));
                output.set_audio_encoder(encoder.clone(), idx).unwrap();
                encoder
            })
            .collect::<Vec<_>>();

        assert!(output.start());
        assert!(output.active());

        Self {
            ctx,
            clock,
            backend,
            output,
            video,
            audio,
            events,
        }
    }

    /// Video pts/dts expressed in 1/30 ticks; one tick is 33333 us.
    pub fn submit_video(&self, ticks: i64, keyframe: bool) {
        self.video.submit_packet(
            payload(32),
            ticks,
            ticks,
            keyframe,
            if keyframe { 0 } else { 2 },
        );
    }

    pub fn submit_audio(&self, track: usize, dts_usec: i64) {
        self.audio[track].submit_packet(payload(8), dts_usec, dts_usec, false, 3);
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}
