use std::sync::{Arc, atomic::Ordering};

use tracing::info;

use crate::output::Output;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayFlags {
    /// Keep the delay buffer across reconnects instead of flushing it.
    pub preserve: bool,
}

/// The delayed-publishing buffer. External collaborator: the core only
/// routes packets into it and expects them back through
/// [`crate::OutputHandle::delayed_packet`] once the configured delay has
/// elapsed.
pub trait DelaySink: Send + Sync + 'static {
    /// Takes ownership of a packet until the delay elapses.
    fn process(&self, packet: EncodedPacket);

    /// Begin a delayed start; the sink is expected to drive
    /// `Output::actual_start` when its buffer schedule calls for it.
    fn delay_start(&self) -> bool;

    /// Begin a delayed stop; remaining buffered packets still drain.
    fn delay_stop(&self);

    /// Drop all buffered contents immediately.
    fn flush(&self);
}

impl Output {
    /// Configures delayed publishing. Takes effect on the next start of an
    /// encoded output.
    pub fn set_delay(&self, delay_sec: u32, flags: DelayFlags) {
        let mut settings = self.settings.lock().unwrap();
        settings.delay_sec = delay_sec;
        settings.delay_flags = flags;
    }

    pub fn delay_sec(&self) -> u32 {
        self.settings.lock().unwrap().delay_sec
    }

    /// Currently applied delay in nanoseconds; zero when the output runs
    /// undelayed.
    pub fn active_delay_ns(&self) -> u64 {
        self.active_delay_ns.load(Ordering::Acquire)
    }

    pub fn delay_active(&self) -> bool {
        self.delay_active.load(Ordering::Acquire)
    }

    pub(crate) fn delay_capturing(&self) -> bool {
        self.delay_capturing.load(Ordering::Acquire)
    }

    pub fn set_delay_sink(&self, sink: Arc<dyn DelaySink>) {
        *self.delay_sink.lock().unwrap() = Some(sink);
    }

    pub(crate) fn delay_sink(&self) -> Option<Arc<dyn DelaySink>> {
        self.delay_sink.lock().unwrap().clone()
    }

    /// Arms the shim: packets go to the sink, and the real callback is
    /// parked until they come back.
    pub(crate) fn activate_delay(&self, inner: PacketCallback) {
        let settings = self.settings.lock().unwrap();
        self.active_delay_ns
            .store(settings.delay_sec as u64 * 1_000_000_000, Ordering::Release);
        self.delay_cur_preserve
            .store(settings.delay_flags.preserve, Ordering::Release);
        *self.delay_callback.lock().unwrap() = Some(inner);
        self.delay_active.store(true, Ordering::Release);

        info!(
            output_id = %self.id(),
            delay_sec = settings.delay_sec,
            preserve_on_disconnect = settings.delay_flags.preserve,
            "Delay active",
        );
    }

    /// Encoded-callback shim while the delay is armed. Ownership of the
    /// packet transfers to the sink.
    pub(crate) fn process_delay(&self, packet: EncodedPacket) {
        match self.delay_sink() {
            Some(sink) => sink.process(packet),
            // no sink wired; degrade to an undelayed output
            None => self.deliver_delayed_packet(packet),
        }
    }

    /// Re-entry point for packets that finished waiting in the sink.
    pub(crate) fn deliver_delayed_packet(&self, packet: EncodedPacket) {
        let callback = self.delay_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(packet);
        }
    }

    /// Backend became ready while a delay is armed: the capture pipeline is
    /// already hooked, so only flip the capture mark and report progress.
    pub(crate) fn begin_delayed_capture(&self) -> bool {
        if self.delay_capturing() {
            return false;
        }

        self.reset_packet_data();
        self.delay_capturing.store(true, Ordering::Release);

        if self.reconnecting() {
            self.ctx()
                .event_emitter
                .emit(Event::OutputReconnectSuccess(self.id().clone()));
            self.reconnecting.store(false, Ordering::Release);
        } else {
            self.ctx().event_emitter.emit(Event::OutputStart(self.id().clone()));
        }

        true
    }

    /// Teardown-side cleanup. The buffer survives only when it was
    /// bookmarked for a preserving reconnect.
    pub(crate) fn cleanup_delay(&self) {
        let preserved = self.delay_cur_preserve.load(Ordering::Acquire)
            && self.delay_restart_refs.load(Ordering::Acquire) > 0;
        if !preserved && let Some(sink) = self.delay_sink() {
            sink.flush();
        }
        if !preserved {
            self.active_delay_ns.store(0, Ordering::Release);
            *self.delay_callback.lock().unwrap() = None;
        }
    }
}
