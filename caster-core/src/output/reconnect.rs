use std::{
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::info;

use crate::output::Output;
use crate::prelude::*;
use crate::thread_utils::ManualResetEvent;

pub(crate) const RECONNECT_RETRY_MAX_MSEC: u32 = 15 * 60 * 1000;
pub(crate) const RECONNECT_RETRY_BASE_EXP: f64 = 1.5;

pub(crate) const DEFAULT_RETRY_SEC: u32 = 2;
pub(crate) const DEFAULT_RETRY_MAX: u32 = 20;

/// Back-off state for one output. The exponent carries a per-output random
/// component so that a fleet of outputs losing the same endpoint does not
/// retry in lockstep.
pub(crate) struct ReconnectState {
    pub retries: AtomicU32,
    pub retry_cur_msec: AtomicU32,
    pub retry_exp: f64,
    pub stop_event: ManualResetEvent,
    pub thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectState {
    pub fn new() -> Self {
        use rand::Rng;
        Self {
            retries: AtomicU32::new(0),
            retry_cur_msec: AtomicU32::new(0),
            retry_exp: RECONNECT_RETRY_BASE_EXP + rand::rng().random::<f64>() * 0.05,
            stop_event: ManualResetEvent::new(false),
            thread: Mutex::new(None),
        }
    }
}

/// Next wait after a failed attempt: exponential growth under a hard cap.
pub(crate) fn next_retry_msec(cur_msec: u32, retry_exp: f64) -> u32 {
    ((cur_msec as f64 * retry_exp) as u32).min(RECONNECT_RETRY_MAX_MSEC)
}

impl Output {
    pub fn set_reconnect_settings(&self, retry_max: u32, retry_sec: u32) {
        let mut settings = self.settings.lock().unwrap();
        settings.reconnect_retry_max = retry_max;
        settings.reconnect_retry_sec = retry_sec;
    }

    pub(crate) fn can_reconnect(&self, code: StopCode) -> bool {
        let reconnect_active = self.settings.lock().unwrap().reconnect_retry_max != 0;

        (self.reconnecting() && code != StopCode::Success)
            || (reconnect_active && code == StopCode::Disconnected)
    }

    /// Schedules the next restart attempt, or gives up with a terminal
    /// `Disconnected` stop once the retry budget is exhausted.
    pub(crate) fn reconnect(&self) {
        let (retry_sec, retry_max) = {
            let settings = self.settings.lock().unwrap();
            (settings.reconnect_retry_sec, settings.reconnect_retry_max)
        };
        let state = &self.reconnect;

        if !self.reconnecting() {
            state
                .retry_cur_msec
                .store(retry_sec * 1000, Ordering::Release);
            state.retries.store(0, Ordering::Release);
        }

        if state.retries.load(Ordering::Acquire) >= retry_max {
            self.set_stop_code(StopCode::Disconnected);
            self.reconnecting.store(false, Ordering::Release);
            if self.delay_active() {
                self.delay_active.store(false, Ordering::Release);
            }
            self.end_data_capture();
            return;
        }

        if !self.reconnecting() {
            self.reconnecting.store(true, Ordering::Release);
            state.stop_event.reset();
        }

        if state.retries.load(Ordering::Acquire) > 0 {
            let grown = next_retry_msec(state.retry_cur_msec.load(Ordering::Acquire), state.retry_exp);
            state.retry_cur_msec.store(grown, Ordering::Release);
        }

        state.retries.fetch_add(1, Ordering::AcqRel);
        self.set_stop_code(StopCode::Disconnected);

        let retry_cur_msec = state.retry_cur_msec.load(Ordering::Acquire);
        self.spawn_reconnect_thread(retry_cur_msec);

        info!(
            output_id = %self.id(),
            "Reconnecting in {:.02} seconds..",
            retry_cur_msec as f64 / 1000.0,
        );
        self.ctx().event_emitter.emit(Event::OutputReconnect {
            output_id: self.id().clone(),
            timeout_sec: retry_cur_msec / 1000,
        });
    }

    fn spawn_reconnect_thread(&self, retry_cur_msec: u32) {
        let weak = self.self_weak.clone();
        let state = &self.reconnect;

        // a previous attempt that already ran to completion can be reaped;
        // a restart scheduled from within the worker itself must not
        // self-join
        if let Some(handle) = state.thread.lock().unwrap().take() {
            if handle.thread().id() == std::thread::current().id() {
                drop(handle);
            } else {
                handle.join().ok();
            }
        }

        let handle = crate::thread_utils::spawn_named(
            "Output reconnect",
            self.id().to_string(),
            move || {
                let Some(output) = weak.upgrade() else {
                    return;
                };
                let timed_out = !output
                    .reconnect
                    .stop_event
                    .wait_timeout(Duration::from_millis(retry_cur_msec as u64));

                if timed_out {
                    output.actual_start();
                }

                if output.reconnect.stop_event.is_set() {
                    output.reconnecting.store(false, Ordering::Release);
                }
            },
        );
        *state.thread.lock().unwrap() = Some(handle);
    }

    /// Cancels a pending reconnect wait and joins the worker.
    pub(crate) fn cancel_reconnect(&self) {
        self.reconnect.stop_event.set();
        let handle = self.reconnect.thread.lock().unwrap().take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            handle.join().ok();
        }
    }
}
