use crate::session::args::ChildSessions;

/// Session lifecycle events caused by debuggee connections going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ThreadExited(i64),
    Exited(i32),
    Terminated,
}

/// Bookkeeping of live debuggee connections and relays of a session.
///
/// `exited` and `terminated` events are produced at most once.
#[derive(Debug)]
pub struct Liveness {
    mode: ChildSessions,
    live: usize,
    exited: bool,
    terminated: bool,
}

impl Liveness {
    pub fn new(mode: ChildSessions) -> Self {
        Self {
            mode,
            live: 0,
            exited: false,
            terminated: false,
        }
    }

    /// Register a new debuggee connection or relay.
    pub fn opened(&mut self) {
        self.live += 1;
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn exit(&mut self, had_error: bool, events: &mut Vec<LifecycleEvent>) {
        if !self.exited {
            self.exited = true;
            events.push(LifecycleEvent::Exited(if had_error { 1 } else { 0 }));
        }
    }

    fn terminate(&mut self, events: &mut Vec<LifecycleEvent>) {
        if !self.terminated {
            self.terminated = true;
            events.push(LifecycleEvent::Terminated);
        }
    }

    /// Debuggee connection owned by the session is closed.
    pub fn connection_closed(&mut self, thread_id: i64, had_error: bool) -> Vec<LifecycleEvent> {
        self.live = self.live.saturating_sub(1);
        let mut events = vec![];

        match self.mode {
            ChildSessions::Threads => {
                if self.live > 0 {
                    events.push(LifecycleEvent::ThreadExited(thread_id));
                } else {
                    self.exit(had_error, &mut events);
                    self.terminate(&mut events);
                }
            }
            ChildSessions::Relay => {
                // the session program is finished, relayed children may still run
                self.exit(had_error, &mut events);
                if self.live == 0 {
                    self.terminate(&mut events);
                }
            }
        }
        events
    }

    /// Relay of a child process is closed.
    pub fn relay_closed(&mut self) -> Vec<LifecycleEvent> {
        self.live = self.live.saturating_sub(1);
        let mut events = vec![];
        if self.live == 0 {
            self.terminate(&mut events);
        }
        events
    }
}
