//! Process identity feed
//!
//! Polls the process table for the process we're tracking and broadcasts a
//! [`StatusEvent`] whenever it appears, restarts, or goes away.

use std::ffi::OsStr;
use std::time::Duration;

use daemonwatch_common::{ProcessIdentity, StatusEvent};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Turns successive process table observations into status events
#[derive(Debug, Default)]
pub struct IdentityState {
    current: Option<ProcessIdentity>,
    /// Whether we've ever seen the process, to tell an init from a reset
    seen: bool,
}

impl IdentityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ProcessIdentity> {
        self.current.as_ref()
    }

    /// Records the process we found (if any), providing the event it amounts
    /// to. **None** if nothing changed.
    pub fn observe(&mut self, found: Option<ProcessIdentity>) -> Option<StatusEvent> {
        if found == self.current {
            return None;
        }

        let event = match &found {
            Some(identity) if !self.seen => {
                StatusEvent::init(identity.pid, Some(identity.name.clone()))
            }
            Some(identity) => StatusEvent::reset(identity.pid, Some(identity.name.clone())),
            None => StatusEvent::stopped(),
        };

        self.seen |= found.is_some();
        self.current = found;
        Some(event)
    }
}

/// Watches the process table for the process we track
pub struct ProcessWatcher {
    system: System,
    name: String,
    pinned_pid: Option<u32>,
    state: IdentityState,
    event_tx: broadcast::Sender<StatusEvent>,
}

impl ProcessWatcher {
    /// Watches for a process with the given name, or for a specific pid if
    /// one is provided.
    pub fn new(name: impl Into<String>, pinned_pid: Option<u32>) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            system: System::new(),
            name: name.into(),
            pinned_pid,
            state: IdentityState::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_tx.subscribe()
    }

    /// Checks the process table once, broadcasting any resulting event.
    pub fn poll(&mut self) -> Option<StatusEvent> {
        let found = self.find_process();
        let event = self.state.observe(found)?;

        info!(
            event = ?event.event_type,
            pid = ?event.pid,
            name = ?event.name,
            "Tracked process status changed"
        );

        // nobody listening isn't a problem
        let _ = self.event_tx.send(event.clone());
        Some(event)
    }

    fn find_process(&mut self) -> Option<ProcessIdentity> {
        match self.pinned_pid {
            Some(pid) => {
                let pid = Pid::from_u32(pid);
                self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

                self.system.process(pid).map(|process| {
                    ProcessIdentity::new(
                        Some(pid.as_u32()),
                        process.name().to_string_lossy().to_string(),
                    )
                })
            }
            None => {
                self.system.refresh_processes(ProcessesToUpdate::All, true);

                // the oldest match is the main process rather than a worker
                self.system
                    .processes_by_exact_name(OsStr::new(&self.name))
                    .map(|process| process.pid().as_u32())
                    .min()
                    .map(|pid| ProcessIdentity::new(Some(pid), self.name.clone()))
            }
        }
    }

    /// Polls on a background task until every subscriber has gone away.
    pub fn spawn(mut self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                self.poll();

                if self.event_tx.receiver_count() == 0 {
                    debug!("No status subscribers left, process watcher exiting");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daemonwatch_common::StatusEventType;

    fn tor(pid: u32) -> Option<ProcessIdentity> {
        Some(ProcessIdentity::new(Some(pid), "tor"))
    }

    #[test]
    fn test_identity_transitions() {
        let mut state = IdentityState::new();

        // not running yet
        assert!(state.observe(None).is_none());

        let event = state.observe(tor(100)).unwrap();
        assert_eq!(event.event_type, StatusEventType::Init);
        assert_eq!(event.pid, Some(100));
        assert_eq!(event.name.as_deref(), Some("tor"));

        assert!(state.observe(tor(100)).is_none());

        let event = state.observe(None).unwrap();
        assert_eq!(event.event_type, StatusEventType::Stopped);
        assert_eq!(event.pid, None);

        // coming back is a reset rather than an init
        let event = state.observe(tor(200)).unwrap();
        assert_eq!(event.event_type, StatusEventType::Reset);
        assert_eq!(state.current(), tor(200).as_ref());

        // as is a restart we didn't catch in between
        let event = state.observe(tor(300)).unwrap();
        assert_eq!(event.event_type, StatusEventType::Reset);
        assert_eq!(event.pid, Some(300));
    }

    #[test]
    fn test_watching_our_own_pid() {
        let mut watcher = ProcessWatcher::new("daemonwatch", Some(std::process::id()));
        let mut rx = watcher.subscribe();

        let event = watcher.poll().unwrap();
        assert_eq!(event.event_type, StatusEventType::Init);
        assert_eq!(event.pid, Some(std::process::id()));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.pid, Some(std::process::id()));

        // nothing changed
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn test_missing_process_produces_nothing() {
        let mut watcher = ProcessWatcher::new("no-such-process-daemonwatch", None);
        assert!(watcher.poll().is_none());
    }
}
