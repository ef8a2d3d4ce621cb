use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;

use crate::types::{OutputId, StopCode};

#[derive(Debug, Clone)]
pub enum Event {
    OutputStarting(OutputId),
    OutputStart(OutputId),
    OutputStopping(OutputId),
    OutputStop {
        output_id: OutputId,
        code: StopCode,
        last_error: Option<Arc<str>>,
    },
    OutputActivate(OutputId),
    OutputDeactivate(OutputId),
    OutputPause(OutputId),
    OutputUnpause(OutputId),
    OutputReconnect {
        output_id: OutputId,
        timeout_sec: u32,
    },
    OutputReconnectSuccess(OutputId),
    OutputWriting(OutputId),
    OutputWrote(OutputId),
    OutputWritingError(OutputId),
}

pub struct EventEmitter {
    senders: Mutex<Vec<Sender<Event>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (sender, receiver) = unbounded();
        self.senders.lock().unwrap().push(sender);
        receiver
    }

    pub fn emit(&self, event: Event) {
        debug!(?event, "Emitting event");
        self.senders
            .lock()
            .unwrap()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish()
    }
}
