use std::sync::{Arc, Weak};

use crate::output::Output;
use crate::prelude::*;

/// Capability bits a backend declares and an output resolves against when
/// hooking data capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFlags {
    pub video: bool,
    pub audio: bool,
    pub encoded: bool,
    pub service: bool,
    pub multi_track: bool,
    pub can_pause: bool,
    pub force_encoder: bool,
}

impl OutputFlags {
    pub const fn encoded_av() -> Self {
        Self {
            video: true,
            audio: true,
            encoded: true,
            service: false,
            multi_track: false,
            can_pause: false,
            force_encoder: false,
        }
    }

    pub(crate) fn intersect(&self, other: &OutputFlags) -> OutputFlags {
        OutputFlags {
            video: self.video && other.video,
            audio: self.audio && other.audio,
            encoded: self.encoded,
            service: self.service && other.service,
            multi_track: self.multi_track && other.multi_track,
            can_pause: self.can_pause,
            force_encoder: self.force_encoder || other.force_encoder,
        }
    }
}

/// An output backend: file muxer, stream sender, or custom sink.
///
/// The core drives the backend through this trait and the backend calls
/// back into the core exclusively through the [`OutputHandle`] it receives
/// in [`OutputBackend::attach`]. Callbacks must not panic; failures are
/// reported out-of-band with [`OutputHandle::signal_stop`].
pub trait OutputBackend: Send + Sync + 'static {
    /// Static backend-kind identifier, e.g. `"rtmp_output"`.
    fn id(&self) -> &str;

    fn flags(&self) -> OutputFlags;

    /// Comma-separated whitelist of encoded video codec names. Empty means
    /// any codec is accepted.
    fn encoded_video_codecs(&self) -> &str {
        ""
    }

    fn encoded_audio_codecs(&self) -> &str {
        ""
    }

    /// Called once when the backend is bound to an output. The handle stays
    /// valid for the lifetime of the output object.
    fn attach(&self, handle: OutputHandle) {
        let _ = handle;
    }

    /// Begin connecting. Returning true means the backend will eventually
    /// call `begin_data_capture` (or `signal_stop` on failure).
    fn start(&self) -> bool;

    /// Stop delivering data. `ts` is the stop timestamp in nanoseconds, or
    /// 0 for a forced stop. The backend finishes asynchronously and calls
    /// `end_data_capture` when done.
    fn stop(&self, ts: u64);

    /// Invoked when the output is destroyed, after all capture threads have
    /// been joined.
    fn destroyed(&self) {}

    fn encoded_packet(&self, packet: EncodedPacket) {
        let _ = packet;
    }

    fn raw_video(&self, frame: VideoFrameData) {
        let _ = frame;
    }

    fn raw_audio(&self, audio: AudioData) {
        let _ = audio;
    }

    /// Multi-mix variant of [`OutputBackend::raw_audio`]; only called when
    /// [`OutputBackend::consumes_audio_mixes`] returns true.
    fn raw_audio2(&self, mix_idx: usize, audio: AudioData) {
        let _ = (mix_idx, audio);
    }

    /// Declares which raw audio shape the backend implements. When true the
    /// core connects every mix selected by the mixer mask and routes blocks
    /// to [`OutputBackend::raw_audio2`].
    fn consumes_audio_mixes(&self) -> bool {
        false
    }

    fn total_bytes(&self) -> u64 {
        0
    }

    fn dropped_frames(&self) -> i32 {
        0
    }

    /// Congestion estimate; the core clamps the result to [0, 1].
    fn congestion(&self) -> f32 {
        0.0
    }

    fn connect_time_ms(&self) -> i32 {
        -1
    }

    fn is_ready_to_update(&self) -> bool {
        true
    }
}

/// A streaming-endpoint credential object. External collaborator; the core
/// only drives its activation lifecycle.
pub trait Service: Send + Sync + 'static {
    fn initialize(&self, output: &OutputHandle) -> bool {
        let _ = output;
        true
    }

    fn activate(&self) {}

    fn deactivate(&self) {}
}

/// Non-owning control handle a backend uses to call back into the core.
///
/// Handles stay usable after the output is destroyed; calls on a dead
/// handle are no-ops.
#[derive(Clone)]
pub struct OutputHandle {
    pub(crate) output: Weak<Output>,
}

impl OutputHandle {
    pub fn upgrade(&self) -> Option<Arc<Output>> {
        self.output.upgrade()
    }

    /// Checks that everything the resolved capture flags require is
    /// attached (encoders, raw sources, service).
    pub fn can_begin_data_capture(&self) -> bool {
        match self.output.upgrade() {
            Some(output) => output.can_begin_data_capture(),
            None => false,
        }
    }

    /// Prepares every attached encoder for capture.
    pub fn initialize_encoders(&self) -> bool {
        match self.output.upgrade() {
            Some(output) => output.initialize_encoders(),
            None => false,
        }
    }

    /// The backend is connected and ready for data; wires the producer
    /// callbacks and flips the output active.
    pub fn begin_data_capture(&self) -> bool {
        match self.output.upgrade() {
            Some(output) => output.begin_data_capture(),
            None => false,
        }
    }

    /// The backend finished stopping; tears the capture pipeline down on a
    /// background thread and emits `stop`.
    pub fn end_data_capture(&self) {
        if let Some(output) = self.output.upgrade() {
            output.end_data_capture();
        }
    }

    /// Reports an abnormal termination. `StopCode::Disconnected` engages
    /// the reconnect loop when one is configured.
    pub fn signal_stop(&self, code: StopCode) {
        if let Some(output) = self.output.upgrade() {
            output.handle_signal_stop(code);
        }
    }

    pub fn set_last_error(&self, message: impl Into<Arc<str>>) {
        if let Some(output) = self.output.upgrade() {
            output.set_last_error(Some(message.into()));
        }
    }

    /// Re-injects a packet that finished waiting in an external delay
    /// buffer into the real dispatch path.
    pub fn delayed_packet(&self, packet: EncodedPacket) {
        if let Some(output) = self.output.upgrade() {
            output.deliver_delayed_packet(packet);
        }
    }

    /// Entry point for the delay buffer once its schedule calls for the
    /// real start.
    pub fn delayed_start(&self) -> bool {
        match self.output.upgrade() {
            Some(output) => output.actual_start(),
            None => false,
        }
    }

    /// Entry point for the delay buffer once its schedule calls for the
    /// real stop.
    pub fn delayed_stop(&self, ts: u64) {
        if let Some(output) = self.output.upgrade() {
            output
                .ctx()
                .event_emitter
                .emit(Event::OutputStopping(output.id().clone()));
            output.actual_stop(false, ts);
        }
    }

    pub fn signal_writing(&self) {
        self.emit_file_event(Event::OutputWriting)
    }

    pub fn signal_wrote(&self) {
        self.emit_file_event(Event::OutputWrote)
    }

    pub fn signal_writing_error(&self) {
        self.emit_file_event(Event::OutputWritingError)
    }

    fn emit_file_event(&self, event: fn(OutputId) -> Event) {
        if let Some(output) = self.output.upgrade() {
            output.ctx().event_emitter.emit(event(output.id().clone()));
        }
    }
}

impl std::fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandle").finish()
    }
}
