use std::sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicBool, Ordering},
};

use tracing::debug;

use crate::output::pause::PauseLedger;
use crate::prelude::*;

pub type PacketCallback = Arc<dyn Fn(EncodedPacket) + Send + Sync>;

/// Encoder internals live outside the core; this trait is the narrow
/// surface the output lifecycle drives.
pub trait EncoderBackend: Send + Sync + 'static {
    /// Prepare the encoder for capture. Called before every start; a false
    /// return aborts the output start and `last_error` is propagated.
    fn initialize(&self) -> bool {
        true
    }

    /// The capture callback has been wired; packets may flow.
    fn started(&self) {}

    /// The capture callback has been removed.
    fn stopped(&self) {}

    fn last_error(&self) -> Option<Arc<str>> {
        None
    }
}

#[derive(Default)]
pub(crate) struct EncoderInit {
    pub initialized: bool,
    /// Back-link to the encoder this one was paired with for startup
    /// alignment. Set only while both sides are inactive and unpaired.
    pub paired: Option<Weak<Encoder>>,
    /// An audio encoder with this flag holds its first packets until its
    /// paired video encoder has produced one, so startup alignment always
    /// has video to align against.
    pub wait_for_video: bool,
}

/// Producer-side contract object for one encoder.
///
/// The entity itself is shared (`Arc`); an output claims exclusive use of
/// it while active. Packets enter through [`Encoder::submit_packet`] from
/// the encoder's worker thread.
pub struct Encoder {
    name: Arc<str>,
    kind: MediaKind,
    timebase: Timebase,
    backend: Box<dyn EncoderBackend>,

    active: AtomicBool,
    paused: AtomicBool,
    pub(crate) init: Mutex<EncoderInit>,
    pub(crate) pause: PauseLedger,
    callback: Mutex<Option<PacketCallback>>,
}

impl Encoder {
    pub fn new(
        name: impl Into<Arc<str>>,
        kind: MediaKind,
        timebase: Timebase,
        backend: Box<dyn EncoderBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            timebase,
            backend,
            active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            init: Mutex::new(EncoderInit::default()),
            pause: PauseLedger::default(),
            callback: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Arc<str>> {
        self.backend.last_error()
    }

    /// True while this audio encoder must hold packets until its paired
    /// video encoder has produced one.
    pub fn wait_for_video(&self) -> bool {
        self.lock_init().wait_for_video
    }

    pub fn paired_encoder(&self) -> Option<Arc<Encoder>> {
        self.lock_init().paired.as_ref()?.upgrade()
    }

    pub fn pause_offset(&self) -> u64 {
        self.pause.offset()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn lock_init(&self) -> MutexGuard<'_, EncoderInit> {
        self.init.lock().unwrap()
    }

    pub(crate) fn ensure_initialized(&self) -> bool {
        let mut init = self.lock_init();
        if init.initialized {
            return true;
        }
        init.initialized = self.backend.initialize();
        init.initialized
    }

    pub(crate) fn force_reinitialize(&self) {
        self.lock_init().initialized = false;
    }

    pub(crate) fn start_capture(&self, callback: PacketCallback) {
        *self.callback.lock().unwrap() = Some(callback);
        self.active.store(true, Ordering::Release);
        self.backend.started();
        debug!(encoder = %self.name, "Encoder capture started");
    }

    pub(crate) fn stop_capture(&self) {
        *self.callback.lock().unwrap() = None;
        self.active.store(false, Ordering::Release);
        let paired = {
            let mut init = self.lock_init();
            init.wait_for_video = false;
            init.paired.take()
        };
        // unpair outside our own init lock; pairing locks audio then video
        if let Some(paired) = paired
            && let Some(paired) = paired.upgrade()
        {
            paired.lock_init().paired = None;
        }
        self.set_paused(false);
        self.pause.reset();
        self.backend.stopped();
        debug!(encoder = %self.name, "Encoder capture stopped");
    }

    /// Entry point for the encoder's worker thread. Fills in the producing
    /// encoder reference and forwards to the output-installed callback.
    pub fn submit_packet(
        self: &Arc<Self>,
        data: bytes::Bytes,
        pts: i64,
        dts: i64,
        keyframe: bool,
        priority: u8,
    ) {
        let packet = EncodedPacket {
            data,
            pts,
            dts,
            timebase: self.timebase,
            kind: self.kind,
            track: 0,
            keyframe,
            priority,
            encoder: EncoderRef(Arc::downgrade(self)),
        };
        // clone out of the lock; the callback may take a long time
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(packet);
        }
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("active", &self.active())
            .finish()
    }
}

/// Identity reference to the encoder that produced a packet. Non-owning so
/// packets in flight never keep an encoder alive.
#[derive(Clone)]
pub struct EncoderRef(pub(crate) Weak<Encoder>);

impl EncoderRef {
    /// A reference matching no encoder; useful for synthetic packets.
    pub fn none() -> Self {
        Self(Weak::new())
    }

    pub fn of(encoder: &Arc<Encoder>) -> Self {
        Self(Arc::downgrade(encoder))
    }

    pub(crate) fn is(&self, encoder: &Arc<Encoder>) -> bool {
        self.0.ptr_eq(&Arc::downgrade(encoder))
    }
}

/// Pairs a video encoder with the first inactive, unpaired audio encoder.
/// All-or-nothing under both init locks, audio first.
pub(crate) fn pair_encoders(video: &Arc<Encoder>, audio_encoders: &[Arc<Encoder>]) {
    let audio = audio_encoders.iter().find(|audio| {
        !audio.active() && audio.lock_init().paired.is_none()
    });
    let Some(audio) = audio else {
        return;
    };

    let mut audio_init = audio.lock_init();
    let mut video_init = video.lock_init();

    if !audio.active()
        && !video.active()
        && video_init.paired.is_none()
        && audio_init.paired.is_none()
    {
        audio_init.wait_for_video = true;
        audio_init.paired = Some(Arc::downgrade(video));
        video_init.paired = Some(Arc::downgrade(audio));
        debug!(video = %video.name, audio = %audio.name, "Paired encoders");
    }
}
