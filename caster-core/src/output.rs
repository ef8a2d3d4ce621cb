use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use tracing::{debug, info, warn};

use crate::encoder::{PacketCallback, pair_encoders};
use crate::prelude::*;
use crate::thread_utils::{ManualResetEvent, spawn_named};

use self::captions::CaptionState;
use self::delay::DelayFlags;
use self::interleave::InterleavedState;
use self::pause::{PauseLedger, closest_frame_ts};
use self::raw::RawAudioState;
use self::reconnect::{DEFAULT_RETRY_MAX, DEFAULT_RETRY_SEC, ReconnectState};

pub mod captions;
pub mod delay;
pub mod interleave;
pub mod pause;
pub mod raw;
pub mod reconnect;

#[cfg(test)]
pub(crate) mod test_support;

/// Shared context every output lives in: the host clock capability, the
/// event bus and the output registry.
pub struct OutputCtx {
    pub clock: Arc<dyn HostClock>,
    pub event_emitter: Arc<EventEmitter>,
    outputs: Mutex<Vec<Weak<Output>>>,
}

impl OutputCtx {
    pub fn new(clock: Arc<dyn HostClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            event_emitter: Arc::new(EventEmitter::new()),
            outputs: Mutex::new(Vec::new()),
        })
    }

    pub fn output_by_id(&self, id: &OutputId) -> Option<Arc<Output>> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|output| output.id() == id)
    }

    pub fn outputs(&self) -> Vec<Arc<Output>> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn register(&self, output: &Arc<Output>) {
        self.outputs.lock().unwrap().push(Arc::downgrade(output));
    }

    fn unregister(&self, output: &Output) {
        self.outputs
            .lock()
            .unwrap()
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), output));
    }
}

impl std::fmt::Debug for OutputCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCtx")
            .field("outputs", &self.outputs.lock().unwrap().len())
            .finish()
    }
}

pub(crate) struct OutputSettings {
    pub video_encoder: Option<Arc<Encoder>>,
    pub audio_encoders: [Option<Arc<Encoder>>; MAX_AUDIO_MIXES],
    pub video: Option<Arc<dyn RawVideoSource>>,
    pub audio: Option<Arc<dyn RawAudioSource>>,
    pub service: Option<Arc<dyn Service>>,
    pub mixer_mask: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub video_conversion: Option<VideoConversion>,
    pub audio_conversion: Option<AudioConversion>,
    pub delay_sec: u32,
    pub delay_flags: DelayFlags,
    pub reconnect_retry_sec: u32,
    pub reconnect_retry_max: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            video_encoder: None,
            audio_encoders: [const { None }; MAX_AUDIO_MIXES],
            video: None,
            audio: None,
            service: None,
            mixer_mask: 1,
            scaled_width: 0,
            scaled_height: 0,
            video_conversion: None,
            audio_conversion: None,
            delay_sec: 0,
            delay_flags: DelayFlags::default(),
            reconnect_retry_sec: DEFAULT_RETRY_SEC,
            reconnect_retry_max: DEFAULT_RETRY_MAX,
        }
    }
}

#[derive(Default)]
struct HookedCallbacks {
    raw_video: Option<RawVideoCallback>,
    raw_audio: Option<RawAudioCallback>,
}

/// One output: the object producers feed, the state machine users drive,
/// and the thing a backend plug-in serves.
///
/// Lock order, outermost first: `settings` → `interleaved` → `captions`;
/// `raw_audio` → `pause`. Encoder pause mutexes are taken video first,
/// then audio in ascending track order. No encoder lock is ever taken
/// while `interleaved` is held.
pub struct Output {
    id: OutputId,
    ctx: Arc<OutputCtx>,
    backend: Arc<dyn OutputBackend>,
    flags: OutputFlags,
    /// Back-reference handed to producer callbacks and worker threads so
    /// none of them keeps the output alive on its own.
    self_weak: Weak<Output>,

    pub(crate) settings: Mutex<OutputSettings>,

    active: AtomicBool,
    data_active: AtomicBool,
    paused: AtomicBool,
    pub(crate) reconnecting: AtomicBool,
    pub(crate) delay_active: AtomicBool,
    pub(crate) delay_capturing: AtomicBool,
    destroyed: AtomicBool,

    stop_code: Mutex<StopCode>,
    last_error: Mutex<Option<Arc<str>>>,

    total_frames: AtomicU32,
    starting_frame_count: AtomicU32,
    starting_drawn_count: AtomicU32,
    starting_lagged_count: AtomicU32,

    pub(crate) interleaved: Mutex<InterleavedState>,
    pub(crate) captions: Mutex<CaptionState>,
    pub(crate) pause: PauseLedger,
    pub(crate) raw_audio: Mutex<RawAudioState>,
    hooked: Mutex<HookedCallbacks>,

    pub(crate) active_delay_ns: AtomicU64,
    pub(crate) delay_cur_preserve: AtomicBool,
    pub(crate) delay_restart_refs: AtomicI64,
    pub(crate) delay_sink: Mutex<Option<Arc<dyn delay::DelaySink>>>,
    pub(crate) delay_callback: Mutex<Option<PacketCallback>>,

    pub(crate) stopping_event: ManualResetEvent,
    pub(crate) reconnect: ReconnectState,
    end_capture_thread: Mutex<Option<JoinHandle<()>>>,
    end_capture_thread_active: AtomicBool,
}

impl Output {
    pub fn new(ctx: &Arc<OutputCtx>, id: OutputId, backend: Arc<dyn OutputBackend>) -> Arc<Self> {
        let flags = backend.flags();
        let output = Arc::new_cyclic(|self_weak| Self {
            id: id.clone(),
            ctx: ctx.clone(),
            backend: backend.clone(),
            flags,
            self_weak: self_weak.clone(),
            settings: Mutex::new(OutputSettings::default()),
            active: AtomicBool::new(false),
            data_active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            delay_active: AtomicBool::new(false),
            delay_capturing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            stop_code: Mutex::new(StopCode::Success),
            last_error: Mutex::new(None),
            total_frames: AtomicU32::new(0),
            starting_frame_count: AtomicU32::new(0),
            starting_drawn_count: AtomicU32::new(0),
            starting_lagged_count: AtomicU32::new(0),
            interleaved: Mutex::new(InterleavedState::default()),
            captions: Mutex::new(CaptionState::default()),
            pause: PauseLedger::default(),
            raw_audio: Mutex::new(RawAudioState::default()),
            hooked: Mutex::new(HookedCallbacks::default()),
            active_delay_ns: AtomicU64::new(0),
            delay_cur_preserve: AtomicBool::new(false),
            delay_restart_refs: AtomicI64::new(0),
            delay_sink: Mutex::new(None),
            delay_callback: Mutex::new(None),
            stopping_event: ManualResetEvent::new(true),
            reconnect: ReconnectState::new(),
            end_capture_thread: Mutex::new(None),
            end_capture_thread_active: AtomicBool::new(false),
        });

        backend.attach(output.handle());
        ctx.register(&output);
        debug!(output_id = %id, kind = backend.id(), "Output created");
        output
    }

    pub fn id(&self) -> &OutputId {
        &self.id
    }

    pub fn ctx(&self) -> &Arc<OutputCtx> {
        &self.ctx
    }

    pub(crate) fn backend(&self) -> &Arc<dyn OutputBackend> {
        &self.backend
    }

    pub fn handle(&self) -> OutputHandle {
        OutputHandle {
            output: self.self_weak.clone(),
        }
    }

    pub fn flags(&self) -> OutputFlags {
        self.flags
    }

    pub fn supported_video_codecs(&self) -> String {
        self.backend.encoded_video_codecs().to_string()
    }

    pub fn supported_audio_codecs(&self) -> String {
        self.backend.encoded_audio_codecs().to_string()
    }

    // ---------------------------------------------------------- state bits

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn data_active(&self) -> bool {
        self.data_active.load(Ordering::Acquire)
    }

    pub fn reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// A stop is in flight from the moment it is requested until the
    /// teardown thread latches the stopping event.
    pub(crate) fn stopping(&self) -> bool {
        !self.stopping_event.is_set()
    }

    fn data_capture_ending(&self) -> bool {
        self.end_capture_thread_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop_code(&self, code: StopCode) {
        *self.stop_code.lock().unwrap() = code;
    }

    pub fn stop_code(&self) -> StopCode {
        *self.stop_code.lock().unwrap()
    }

    pub(crate) fn count_video_frame(&self) {
        self.total_frames.fetch_add(1, Ordering::AcqRel);
    }

    // -------------------------------------------------------- configuration

    pub fn set_video_encoder(&self, encoder: Arc<Encoder>) -> Result<(), OutputConfigError> {
        if encoder.kind() != MediaKind::Video {
            return Err(OutputConfigError::EncoderKindMismatch {
                encoder: encoder.name().clone(),
                expected: MediaKind::Video,
                actual: encoder.kind(),
            });
        }
        if self.active() {
            return Err(OutputConfigError::OutputActive(self.id.clone()));
        }
        self.settings.lock().unwrap().video_encoder = Some(encoder);
        Ok(())
    }

    pub fn set_audio_encoder(
        &self,
        encoder: Arc<Encoder>,
        idx: usize,
    ) -> Result<(), OutputConfigError> {
        if encoder.kind() != MediaKind::Audio {
            return Err(OutputConfigError::EncoderKindMismatch {
                encoder: encoder.name().clone(),
                expected: MediaKind::Audio,
                actual: encoder.kind(),
            });
        }
        if self.active() {
            return Err(OutputConfigError::OutputActive(self.id.clone()));
        }
        if idx >= MAX_AUDIO_MIXES {
            return Err(OutputConfigError::TrackOutOfRange(idx));
        }
        if !self.flags.multi_track && idx > 0 {
            return Err(OutputConfigError::NotMultiTrack(self.id.clone()));
        }
        self.settings.lock().unwrap().audio_encoders[idx] = Some(encoder);
        Ok(())
    }

    pub fn video_encoder(&self) -> Option<Arc<Encoder>> {
        self.settings.lock().unwrap().video_encoder.clone()
    }

    pub fn audio_encoder(&self, idx: usize) -> Option<Arc<Encoder>> {
        self.settings.lock().unwrap().audio_encoders.get(idx)?.clone()
    }

    pub fn set_media(
        &self,
        video: Option<Arc<dyn RawVideoSource>>,
        audio: Option<Arc<dyn RawAudioSource>>,
    ) {
        let mut settings = self.settings.lock().unwrap();
        settings.video = video;
        settings.audio = audio;
    }

    pub fn set_service(&self, service: Option<Arc<dyn Service>>) {
        self.settings.lock().unwrap().service = service;
    }

    pub fn set_mixer(&self, mix_idx: usize) -> Result<(), OutputConfigError> {
        self.set_mixers(1 << mix_idx)
    }

    pub fn set_mixers(&self, mixer_mask: u32) -> Result<(), OutputConfigError> {
        if self.active() {
            return Err(OutputConfigError::OutputActive(self.id.clone()));
        }
        self.settings.lock().unwrap().mixer_mask = mixer_mask;
        Ok(())
    }

    pub fn mixer_mask(&self) -> u32 {
        self.settings.lock().unwrap().mixer_mask
    }

    pub(crate) fn first_mixer(&self) -> usize {
        let mask = self.settings.lock().unwrap().mixer_mask;
        if mask == 0 {
            0
        } else {
            mask.trailing_zeros() as usize
        }
    }

    pub fn set_preferred_size(&self, width: u32, height: u32) {
        if self.active() {
            warn!(output_id = %self.id, "Cannot resize an active output");
            return;
        }
        let mut settings = self.settings.lock().unwrap();
        settings.scaled_width = width;
        settings.scaled_height = height;
    }

    pub fn width(&self) -> u32 {
        resolved_size(&self.settings.lock().unwrap()).0
    }

    pub fn height(&self) -> u32 {
        resolved_size(&self.settings.lock().unwrap()).1
    }

    pub fn set_video_conversion(&self, conversion: Option<VideoConversion>) {
        self.settings.lock().unwrap().video_conversion = conversion;
    }

    pub fn set_audio_conversion(&self, conversion: Option<AudioConversion>) {
        self.settings.lock().unwrap().audio_conversion = conversion;
    }

    // ------------------------------------------------------------ lifecycle

    pub fn start(&self) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }

        let service = self.settings.lock().unwrap().service.clone();
        if self.flags.service
            && let Some(service) = &service
            && !service.initialize(&self.handle())
        {
            warn!(output_id = %self.id, "Service refused to initialize");
            return false;
        }

        let delay_sec = self.settings.lock().unwrap().delay_sec;
        if self.flags.encoded && delay_sec > 0 {
            if let Some(sink) = self.delay_sink() {
                return sink.delay_start();
            }
            warn!(output_id = %self.id, "Delay configured but no delay sink wired; starting undelayed");
        }

        if self.actual_start() {
            self.ctx
                .event_emitter
                .emit(Event::OutputStarting(self.id.clone()));
            true
        } else {
            false
        }
    }

    /// Connects the backend. Also the re-entry point for reconnect attempts
    /// and delayed starts.
    pub(crate) fn actual_start(&self) -> bool {
        self.stopping_event.wait();
        self.set_stop_code(StopCode::Success);
        self.set_last_error(None);

        let success = self.backend.start();

        if success {
            let video = self.settings.lock().unwrap().video.clone();
            self.starting_frame_count.store(
                video.map(|v| v.total_frames()).unwrap_or(0),
                Ordering::Release,
            );
            self.starting_drawn_count
                .store(self.ctx.clock.total_drawn_frames(), Ordering::Release);
            self.starting_lagged_count
                .store(self.ctx.clock.lagged_frames(), Ordering::Release);
        }

        if self.delay_restart_refs.load(Ordering::Acquire) > 0 {
            self.delay_restart_refs.fetch_sub(1, Ordering::AcqRel);
        }

        self.reset_caption_data();

        success
    }

    pub fn stop(&self) {
        if !self.active() && !self.reconnecting() {
            return;
        }
        if self.reconnecting() {
            self.force_stop();
            return;
        }

        if self.flags.encoded && self.active_delay_ns() > 0 {
            if let Some(sink) = self.delay_sink() {
                sink.delay_stop();
                return;
            }
        }

        if !self.stopping() {
            self.ctx
                .event_emitter
                .emit(Event::OutputStopping(self.id.clone()));
            self.actual_stop(false, self.ctx.clock.now_ns());
        }
    }

    /// Ignores an in-flight stop latch, passes ts=0 to the backend and
    /// drops any delay-buffer contents.
    pub fn force_stop(&self) {
        if !self.stopping() {
            self.set_stop_code(StopCode::Success);
            self.ctx
                .event_emitter
                .emit(Event::OutputStopping(self.id.clone()));
        }
        self.actual_stop(true, 0);
    }

    pub(crate) fn actual_stop(&self, force: bool, ts: u64) {
        if self.stopping() && !force {
            return;
        }

        self.pause(false);

        self.stopping_event.reset();

        if self.reconnecting() {
            self.cancel_reconnect();
        }

        let mut call_stop = true;
        if force && self.delay_active() {
            call_stop = self.delay_capturing();
            self.delay_active.store(false, Ordering::Release);
            self.delay_capturing.store(false, Ordering::Release);
            self.set_stop_code(StopCode::Success);
            if let Some(sink) = self.delay_sink() {
                sink.flush();
            }
            self.end_data_capture();
            self.stopping_event.set();
        }

        if call_stop {
            self.backend.stop(ts);
        }

        self.clear_caption_lines();
    }

    // --------------------------------------------------------------- pause

    pub fn can_pause(&self) -> bool {
        self.flags.can_pause
    }

    pub fn pause(&self, pause: bool) -> bool {
        if !self.flags.can_pause {
            return false;
        }
        if !self.active() {
            return false;
        }
        if self.paused() == pause {
            return true;
        }

        let success = if self.flags.encoded {
            self.encoded_pause(pause)
        } else {
            self.raw_pause(pause)
        };

        if success {
            self.paused.store(pause, Ordering::Release);
            self.ctx.event_emitter.emit(if pause {
                Event::OutputPause(self.id.clone())
            } else {
                Event::OutputUnpause(self.id.clone())
            });
            info!(output_id = %self.id, "Output {}paused", if pause { "" } else { "un" });
        }
        success
    }

    /// Pauses every owned encoder at the same frame-aligned timestamp, or
    /// none of them.
    fn encoded_pause(&self, pause: bool) -> bool {
        let (video_encoder, audio_encoders) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.video_encoder.clone(),
                settings
                    .audio_encoders
                    .iter()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        let Some(video_encoder) = video_encoder else {
            return false;
        };

        let mut video_ledger = video_encoder.pause.lock();
        let mut audio_ledgers = audio_encoders
            .iter()
            .map(|encoder| encoder.pause.lock())
            .collect::<Vec<_>>();

        let closest_v_ts = closest_frame_ts(&video_ledger, self.ctx.clock.as_ref());

        if pause {
            if !video_ledger.can_start() || audio_ledgers.iter().any(|l| !l.can_start()) {
                return false;
            }

            video_encoder.set_paused(true);
            video_ledger.ts_start = closest_v_ts;
            for (encoder, ledger) in audio_encoders.iter().zip(audio_ledgers.iter_mut()) {
                encoder.set_paused(true);
                ledger.ts_start = closest_v_ts;
            }
        } else {
            if !video_ledger.can_stop() || audio_ledgers.iter().any(|l| !l.can_stop()) {
                return false;
            }

            video_encoder.set_paused(false);
            video_ledger.end_pause(closest_v_ts);
            for (encoder, ledger) in audio_encoders.iter().zip(audio_ledgers.iter_mut()) {
                encoder.set_paused(false);
                ledger.end_pause(closest_v_ts);
            }
        }

        true
    }

    fn raw_pause(&self, pause: bool) -> bool {
        let mut ledger = self.pause.lock();
        let closest_v_ts = closest_frame_ts(&ledger, self.ctx.clock.as_ref());
        if pause {
            let success = ledger.can_start();
            if success {
                ledger.ts_start = closest_v_ts;
            }
            success
        } else {
            let success = ledger.can_stop();
            if success {
                ledger.end_pause(closest_v_ts);
            }
            success
        }
    }

    /// Accumulated pause time of the raw path in nanoseconds.
    pub fn pause_offset(&self) -> u64 {
        self.pause.offset()
    }

    // ------------------------------------------------------- data capture

    pub(crate) fn num_audio_mixes(&self) -> usize {
        if !self.flags.multi_track {
            return 1;
        }
        let settings = self.settings.lock().unwrap();
        settings
            .audio_encoders
            .iter()
            .take_while(|encoder| encoder.is_some())
            .count()
    }

    pub(crate) fn audio_track_index(&self, encoder: &EncoderRef) -> usize {
        let settings = self.settings.lock().unwrap();
        for (idx, slot) in settings.audio_encoders.iter().enumerate() {
            if let Some(slot) = slot
                && encoder.is(slot)
            {
                return idx;
            }
        }
        debug_assert!(false, "packet from an encoder that is not attached");
        0
    }

    fn resolve_flags(&self, requested: Option<OutputFlags>) -> OutputFlags {
        match requested {
            None => {
                let mut flags = self.flags;
                flags.force_encoder = true;
                flags
            }
            Some(requested) => self.flags.intersect(&requested),
        }
    }

    fn audio_valid(&self, encoded: bool) -> bool {
        if !encoded {
            return self.settings.lock().unwrap().audio.is_some();
        }
        let mix_count = self.num_audio_mixes();
        if mix_count == 0 {
            return false;
        }
        let settings = self.settings.lock().unwrap();
        settings.audio_encoders[0..mix_count]
            .iter()
            .all(|encoder| encoder.is_some())
    }

    pub fn can_begin_data_capture(&self) -> bool {
        if self.delay_active() {
            return true;
        }
        if self.active() {
            return false;
        }
        if self.data_capture_ending() {
            self.join_end_capture_thread();
        }
        self.can_begin_data_capture_resolved(self.resolve_flags(None))
    }

    fn can_begin_data_capture_resolved(&self, flags: OutputFlags) -> bool {
        if flags.video {
            let has_video_source = if flags.encoded {
                self.settings.lock().unwrap().video_encoder.is_some()
            } else {
                self.settings.lock().unwrap().video.is_some()
            };
            if !has_video_source {
                return false;
            }
        }

        if flags.audio && !self.audio_valid(flags.encoded) {
            return false;
        }

        if flags.service && self.settings.lock().unwrap().service.is_none() {
            return false;
        }

        true
    }

    /// Prepares every attached encoder. Failures propagate the encoder's
    /// error into this output's `last_error`.
    pub fn initialize_encoders(&self) -> bool {
        if self.active() {
            return self.delay_active();
        }

        let flags = self.resolve_flags(None);
        if !flags.encoded {
            return false;
        }

        if flags.video {
            let Some(encoder) = self.video_encoder() else {
                return false;
            };
            if flags.force_encoder {
                encoder.force_reinitialize();
            }
            if !encoder.ensure_initialized() {
                self.set_last_error(encoder.last_error());
                return false;
            }
        }

        if flags.audio {
            for idx in 0..self.num_audio_mixes() {
                let Some(encoder) = self.audio_encoder(idx) else {
                    return false;
                };
                if flags.force_encoder {
                    encoder.force_reinitialize();
                }
                if !encoder.ensure_initialized() {
                    self.set_last_error(encoder.last_error());
                    return false;
                }
            }
        }

        true
    }

    /// Called by the backend once its connection is up. Wires producer
    /// callbacks and flips the output active.
    pub(crate) fn begin_data_capture(&self) -> bool {
        if self.delay_active() {
            return self.begin_delayed_capture();
        }
        if self.active() {
            return false;
        }

        self.total_frames.store(0, Ordering::Release);

        let flags = self.resolve_flags(None);

        if !flags.encoded {
            self.reset_raw_output();
        }

        if !self.can_begin_data_capture_resolved(flags) {
            return false;
        }

        if flags.encoded && flags.video && flags.audio {
            let settings = self.settings.lock().unwrap();
            if let Some(video) = &settings.video_encoder {
                let audio = settings
                    .audio_encoders
                    .iter()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>();
                pair_encoders(video, &audio);
            }
        }

        self.data_active.store(true, Ordering::Release);
        self.hook_data_capture(flags);

        if flags.service
            && let Some(service) = self.settings.lock().unwrap().service.clone()
        {
            service.activate();
        }

        self.ctx
            .event_emitter
            .emit(Event::OutputActivate(self.id.clone()));
        self.active.store(true, Ordering::Release);

        if self.reconnecting() {
            self.ctx
                .event_emitter
                .emit(Event::OutputReconnectSuccess(self.id.clone()));
            self.reconnecting.store(false, Ordering::Release);
        } else if self.delay_active() {
            self.ctx
                .event_emitter
                .emit(Event::OutputStarting(self.id.clone()));
        } else {
            self.ctx.event_emitter.emit(Event::OutputStart(self.id.clone()));
        }

        true
    }

    fn hook_data_capture(&self, flags: OutputFlags) {
        if flags.encoded {
            self.reset_packet_data();

            let weak = self.self_weak.clone();
            let interleaved = flags.video && flags.audio;
            let inner: PacketCallback = Arc::new(move |packet| {
                let Some(output) = weak.upgrade() else {
                    return;
                };
                if interleaved {
                    output.interleave_packet(packet);
                } else {
                    output.direct_encoded_packet(packet);
                }
            });

            let callback = if self.settings.lock().unwrap().delay_sec > 0 {
                self.activate_delay(inner);
                let weak = self.self_weak.clone();
                let shim: PacketCallback = Arc::new(move |packet| {
                    if let Some(output) = weak.upgrade() {
                        output.process_delay(packet);
                    }
                });
                shim
            } else {
                inner
            };

            let settings = self.settings.lock().unwrap();
            if flags.audio {
                for encoder in settings.audio_encoders.iter().flatten() {
                    encoder.start_capture(callback.clone());
                }
            }
            if flags.video
                && let Some(encoder) = &settings.video_encoder
            {
                encoder.start_capture(callback.clone());
            }
        } else {
            if flags.video {
                self.hook_raw_video();
            }
            if flags.audio {
                self.hook_raw_audio();
            }
        }
    }

    fn direct_encoded_packet(&self, mut packet: EncodedPacket) {
        if !self.data_active() {
            return;
        }
        if packet.kind == MediaKind::Audio {
            packet.track = self.audio_track_index(&packet.encoder);
        }
        let is_video = packet.kind == MediaKind::Video;
        self.backend.encoded_packet(packet);
        if is_video {
            self.count_video_frame();
        }
    }

    fn hook_raw_video(&self) {
        let (video, conversion) = {
            let settings = self.settings.lock().unwrap();
            (settings.video.clone(), self.video_conversion(&settings))
        };
        let Some(video) = video else {
            return;
        };

        let weak = self.self_weak.clone();
        let callback: RawVideoCallback = Arc::new(move |frame| {
            if let Some(output) = weak.upgrade() {
                output.raw_video_frame(frame);
            }
        });
        video.connect(conversion, callback.clone());
        self.hooked.lock().unwrap().raw_video = Some(callback);
    }

    fn hook_raw_audio(&self) {
        let (audio, conversion, mixer_mask) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.audio.clone(),
                settings.audio_conversion,
                settings.mixer_mask,
            )
        };
        let Some(audio) = audio else {
            return;
        };

        let weak = self.self_weak.clone();
        let callback: RawAudioCallback = Arc::new(move |mix_idx, block| {
            if let Some(output) = weak.upgrade() {
                output.raw_audio_block(mix_idx, block);
            }
        });

        if self.backend.consumes_audio_mixes() {
            for idx in 0..MAX_AUDIO_MIXES {
                if mixer_mask & (1 << idx) != 0 {
                    audio.connect(idx, conversion, callback.clone());
                }
            }
        } else {
            audio.connect(self.first_mixer(), conversion, callback.clone());
        }
        self.hooked.lock().unwrap().raw_audio = Some(callback);
    }

    /// Resolved video conversion: an explicit override wins, otherwise a
    /// preferred size that differs from the source resolution implies one.
    fn video_conversion(&self, settings: &OutputSettings) -> Option<VideoConversion> {
        if let Some(mut conversion) = settings.video_conversion {
            let (width, height) = resolved_size(settings);
            if conversion.width == 0 {
                conversion.width = width;
            }
            if conversion.height == 0 {
                conversion.height = height;
            }
            return Some(conversion);
        }

        let source_info = settings.video.as_ref().map(|v| v.info())?;
        let scaled = settings.scaled_width != 0
            && settings.scaled_height != 0
            && (settings.scaled_width != source_info.width
                || settings.scaled_height != source_info.height);
        scaled.then_some(VideoConversion {
            width: settings.scaled_width,
            height: settings.scaled_height,
        })
    }

    fn reset_raw_output(&self) {
        let (info, conversion) = {
            let settings = self.settings.lock().unwrap();
            (
                settings.audio.as_ref().map(|a| a.info()),
                settings.audio_conversion,
            )
        };
        self.raw_audio.lock().unwrap().reset(info, conversion);
        self.pause.reset();
    }

    /// Called by the backend once it has fully stopped. Spawns the teardown
    /// worker that unhooks producers and completes the stop.
    pub(crate) fn end_data_capture(&self) {
        self.end_data_capture_internal(true)
    }

    pub(crate) fn end_data_capture_internal(&self, signal: bool) {
        if !self.active() || !self.data_active() {
            if signal {
                self.emit_stop_event();
                self.set_stop_code(StopCode::Success);
                self.stopping_event.set();
            }
            return;
        }

        if self.delay_active() {
            self.delay_capturing.store(false, Ordering::Release);

            if self.delay_restart_refs.load(Ordering::Acquire) == 0 {
                self.delay_active.store(false, Ordering::Release);
            } else {
                self.stopping_event.set();
                return;
            }
        }

        self.data_active.store(false, Ordering::Release);

        if self.settings.lock().unwrap().video.is_some() {
            self.log_frame_info();
        }

        if self.data_capture_ending() {
            self.join_end_capture_thread();
        }

        self.end_capture_thread_active.store(true, Ordering::Release);
        let weak = self.self_weak.clone();
        let handle = spawn_named("Output teardown", self.id.to_string(), move || {
            if let Some(output) = weak.upgrade() {
                output.end_data_capture_thread();
            }
        });
        *self.end_capture_thread.lock().unwrap() = Some(handle);

        if signal {
            self.emit_stop_event();
            self.set_stop_code(StopCode::Success);
        }
    }

    fn end_data_capture_thread(&self) {
        let flags = self.resolve_flags(None);

        if flags.encoded {
            let settings = self.settings.lock().unwrap();
            if flags.video
                && let Some(encoder) = &settings.video_encoder
            {
                encoder.stop_capture();
            }
            if flags.audio {
                for encoder in settings.audio_encoders.iter().flatten() {
                    encoder.stop_capture();
                }
            }
        } else {
            let hooked = std::mem::take(&mut *self.hooked.lock().unwrap());
            let settings = self.settings.lock().unwrap();
            if let (Some(video), Some(callback)) = (&settings.video, &hooked.raw_video) {
                video.disconnect(callback);
            }
            if let (Some(audio), Some(callback)) = (&settings.audio, &hooked.raw_audio) {
                if self.backend.consumes_audio_mixes() {
                    let mixer_mask = settings.mixer_mask;
                    for idx in 0..MAX_AUDIO_MIXES {
                        if mixer_mask & (1 << idx) != 0 {
                            audio.disconnect(idx, callback);
                        }
                    }
                } else {
                    audio.disconnect(self.first_mixer_locked(&settings), callback);
                }
            }
        }

        if flags.service
            && let Some(service) = self.settings.lock().unwrap().service.clone()
        {
            service.deactivate();
        }

        if self.active_delay_ns() > 0 {
            self.cleanup_delay();
        }

        self.ctx
            .event_emitter
            .emit(Event::OutputDeactivate(self.id.clone()));
        self.active.store(false, Ordering::Release);
        self.stopping_event.set();
        self.end_capture_thread_active.store(false, Ordering::Release);
    }

    fn first_mixer_locked(&self, settings: &OutputSettings) -> usize {
        if settings.mixer_mask == 0 {
            0
        } else {
            settings.mixer_mask.trailing_zeros() as usize
        }
    }

    fn join_end_capture_thread(&self) {
        let handle = self.end_capture_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().ok();
        }
    }

    /// Backend-reported termination. Reconnects when the code and settings
    /// allow it, otherwise completes the stop.
    pub(crate) fn handle_signal_stop(&self, code: StopCode) {
        self.set_stop_code(code);

        if self.can_reconnect(code) {
            if self.delay_active() {
                self.delay_restart_refs.fetch_add(1, Ordering::AcqRel);
            }
            self.end_data_capture_internal(false);
            self.reconnect();
        } else {
            if self.delay_active() {
                self.delay_active.store(false, Ordering::Release);
            }
            self.end_data_capture();
        }
    }

    fn emit_stop_event(&self) {
        self.ctx.event_emitter.emit(Event::OutputStop {
            output_id: self.id.clone(),
            code: self.stop_code(),
            last_error: self.last_error(),
        });
    }

    // ------------------------------------------------------------- destroy

    /// Tears the output down completely. The object stays safe to touch
    /// through remaining handles; every later lifecycle call is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.ctx.unregister(self);
        debug!(output_id = %self.id, "Output destroyed");

        if self.active() {
            self.actual_stop(true, 0);
        }

        self.stopping_event.wait();
        self.join_end_capture_thread();

        self.backend.destroyed();
        // the backend's shutdown may itself have flipped the output active
        // and ended capture again; reap that thread too
        self.stopping_event.wait();
        self.join_end_capture_thread();

        self.cancel_reconnect();

        self.interleaved.lock().unwrap().reset();
        self.clear_caption_lines();
        self.reset_caption_data();
        self.raw_audio.lock().unwrap().reset(None, None);

        let mut settings = self.settings.lock().unwrap();
        settings.video_encoder = None;
        settings.audio_encoders = [const { None }; MAX_AUDIO_MIXES];
        settings.service = None;
    }

    // ----------------------------------------------------------- statistics

    pub fn total_bytes(&self) -> u64 {
        self.backend.total_bytes()
    }

    pub fn frames_dropped(&self) -> i32 {
        self.backend.dropped_frames()
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames.load(Ordering::Acquire)
    }

    pub fn congestion(&self) -> f32 {
        self.backend.congestion().clamp(0.0, 1.0)
    }

    pub fn connect_time_ms(&self) -> i32 {
        self.backend.connect_time_ms()
    }

    pub fn is_ready_to_update(&self) -> bool {
        self.backend.is_ready_to_update()
    }

    pub fn set_last_error(&self, message: Option<Arc<str>>) {
        *self.last_error.lock().unwrap() = message;
    }

    /// This output's error, falling back to the video encoder's and then
    /// each audio encoder's in track order.
    pub fn last_error(&self) -> Option<Arc<str>> {
        if let Some(message) = self.last_error.lock().unwrap().clone() {
            return Some(message);
        }

        let settings = self.settings.lock().unwrap();
        if let Some(encoder) = &settings.video_encoder
            && let Some(message) = encoder.last_error()
        {
            return Some(message);
        }
        settings
            .audio_encoders
            .iter()
            .flatten()
            .find_map(|encoder| encoder.last_error())
    }

    fn log_frame_info(&self) {
        let drawn = self
            .ctx
            .clock
            .total_drawn_frames()
            .saturating_sub(self.starting_drawn_count.load(Ordering::Acquire));
        let lagged = self
            .ctx
            .clock
            .lagged_frames()
            .saturating_sub(self.starting_lagged_count.load(Ordering::Acquire));
        let dropped = self.frames_dropped();
        let total = self.total_frames();

        info!(output_id = %self.id, "Output stopping");
        if dropped <= 0 || total == 0 {
            info!(output_id = %self.id, "Total frames output: {total}");
        } else {
            info!(
                output_id = %self.id,
                "Total frames output: {} ({total} attempted)",
                total as i64 - dropped as i64,
            );
        }
        if lagged == 0 || drawn == 0 {
            info!(output_id = %self.id, "Total drawn frames: {drawn}");
        } else {
            info!(
                output_id = %self.id,
                "Total drawn frames: {} ({drawn} attempted), lagged: {lagged} ({:.1}%)",
                drawn - lagged,
                lagged as f64 / drawn as f64 * 100.0,
            );
        }
        if total != 0 && dropped > 0 {
            info!(
                output_id = %self.id,
                "Number of dropped frames due to insufficient bandwidth/connection stalls: {dropped} ({:.1}%)",
                dropped as f64 / total as f64 * 100.0,
            );
        }
    }
}

fn resolved_size(settings: &OutputSettings) -> (u32, u32) {
    let source = settings.video.as_ref().map(|v| v.info());
    let width = if settings.scaled_width != 0 {
        settings.scaled_width
    } else {
        source.map(|info| info.width).unwrap_or(0)
    };
    let height = if settings.scaled_height != 0 {
        settings.scaled_height
    } else {
        source.map(|info| info.height).unwrap_or(0)
    };
    (width, height)
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("id", &self.id)
            .field("kind", &self.backend.id())
            .field("active", &self.active())
            .field("reconnecting", &self.reconnecting())
            .field("paused", &self.paused())
            .finish()
    }
}

#[cfg(test)]
mod output_tests;
