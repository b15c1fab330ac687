//! Commands and the loop wakeup signal
//!
//! Other threads talk to the playback loop only through a [`ControlHandle`]:
//! commands are queued and the loop is woken from its per-tick sleep.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::seek::{SeekKind, SeekPrecision};

/// Everything the outer layers may ask of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Seek {
        kind: SeekKind,
        amount: f64,
        precision: SeekPrecision,
        immediate: bool,
    },
    Pause,
    Unpause,
    TogglePause,
    /// Positive steps forward, negative steps back one frame
    FrameStep(i32),
    SetSpeed(f64),
    Stop,
}

#[derive(Default)]
struct Inbox {
    commands: VecDeque<Command>,
    woken: bool,
}

#[derive(Default)]
struct Shared {
    inbox: Mutex<Inbox>,
    cond: Condvar,
}

/// Cloneable, thread-safe handle into the playback loop
#[derive(Clone, Default)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, cmd: Command) {
        let mut inbox = self.shared.inbox.lock();
        inbox.commands.push_back(cmd);
        inbox.woken = true;
        self.shared.cond.notify_one();
    }

    /// Interrupt the current sleep without a command (new data, timer...)
    pub fn wakeup(&self) {
        let mut inbox = self.shared.inbox.lock();
        inbox.woken = true;
        self.shared.cond.notify_one();
    }

    /// Sleep until woken or `timeout` passes, then hand out queued commands
    pub fn wait(&self, timeout: Duration) -> Vec<Command> {
        let mut inbox = self.shared.inbox.lock();
        if !inbox.woken && !timeout.is_zero() {
            let _ = self.shared.cond.wait_while_for(&mut inbox, |i| !i.woken, timeout);
        }
        inbox.woken = false;
        inbox.commands.drain(..).collect()
    }

    /// Take queued commands without sleeping
    pub fn drain(&self) -> Vec<Command> {
        self.wait(Duration::ZERO)
    }
}
