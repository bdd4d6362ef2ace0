//! The set of live sessions, owned by the event loop.
//!
//! Sessions enter only fully established and leave through `reap`, which
//! closes their descriptors. Login children that outlive their session are
//! parked here and polled until the kernel hands back their status.

use super::bridge::{Session, SessionId};
use super::pty::ChildProcess;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    /// Killed children not yet collected.
    orphans: Vec<Box<dyn ChildProcess>>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the identifier for the next session.
    pub fn next_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    pub fn insert(&mut self, session: Session) {
        let id = session.id();
        info!(session = %id, peer = %session.peer(), "session registered");
        if self.sessions.insert(id, session).is_some() {
            warn!(session = %id, "replaced a session with a duplicate id");
        }
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Keep polling a child whose session is gone.
    pub fn adopt(&mut self, child: Box<dyn ChildProcess>) {
        debug!(pid = ?child.pid(), "adopting unreaped child");
        self.orphans.push(child);
    }

    /// Tear down every session that has finished closing.
    pub fn reap(&mut self, now: Instant, linger: Duration) {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_finished(now, linger))
            .map(|(id, _)| *id)
            .collect();

        for id in &finished {
            if let Some(session) = self.sessions.remove(id) {
                if let Some(child) = session.teardown() {
                    self.adopt(child);
                }
            }
        }

        if !finished.is_empty() {
            debug!(count = finished.len(), live = self.sessions.len(), "reaped sessions");
        }
    }

    /// Non-blocking status check of every live child and every orphan.
    pub fn check_children(&mut self, now: Instant, grace: Duration) {
        for session in self.sessions.values_mut() {
            session.check_child(now, grace);
        }

        self.orphans.retain_mut(|child| match child.try_wait() {
            Ok(Some(exit)) => {
                debug!(pid = ?child.pid(), code = exit.code, "orphan reaped");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = ?child.pid(), error = %e, "dropping orphan after wait error");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::ChildExit;
    use telnet_core::{TelnetError, TelnetResult};

    /// Exits after being polled `remaining` more times.
    struct SlowChild {
        remaining: u32,
        fail: bool,
    }

    impl ChildProcess for SlowChild {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_wait(&mut self) -> TelnetResult<Option<ChildExit>> {
            if self.fail {
                return Err(TelnetError::Other("wait failed".into()));
            }
            if self.remaining == 0 {
                return Ok(Some(ChildExit { code: 137 }));
            }
            self.remaining -= 1;
            Ok(None)
        }

        fn kill(&mut self) -> TelnetResult<()> {
            Ok(())
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut registry = Registry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "#1");
    }

    #[test]
    fn orphans_are_polled_until_collected() {
        let mut registry = Registry::new();
        registry.adopt(Box::new(SlowChild {
            remaining: 2,
            fail: false,
        }));
        registry.adopt(Box::new(SlowChild {
            remaining: 0,
            fail: false,
        }));
        assert_eq!(registry.orphan_count(), 2);

        registry.check_children(Instant::now(), Duration::ZERO);
        assert_eq!(registry.orphan_count(), 1);
        registry.check_children(Instant::now(), Duration::ZERO);
        assert_eq!(registry.orphan_count(), 1);
        registry.check_children(Instant::now(), Duration::ZERO);
        assert_eq!(registry.orphan_count(), 0);
    }

    #[test]
    fn orphan_with_wait_error_is_dropped() {
        let mut registry = Registry::new();
        registry.adopt(Box::new(SlowChild {
            remaining: 5,
            fail: true,
        }));
        registry.check_children(Instant::now(), Duration::ZERO);
        assert_eq!(registry.orphan_count(), 0);
    }

    #[test]
    fn reap_on_empty_registry_is_a_no_op() {
        let mut registry = Registry::new();
        registry.reap(Instant::now(), Duration::ZERO);
        assert!(registry.is_empty());
        assert_eq!(registry.orphan_count(), 0);
    }
}
