//! Completion tokens for asynchronous device commands.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::DeviceError;

/// Opaque handle to a pending or finished asynchronous operation.
///
/// The pipeline runtime only ever waits on or polls a token; how it is
/// signalled is up to the backend that produced it.
pub trait CompletionToken: Send + Sync + fmt::Debug {
    /// Block until the operation finished. Returns the failure if it did not
    /// complete successfully.
    fn wait(&self) -> Result<(), DeviceError>;

    fn is_ready(&self) -> bool;
}

/// Shared, type-erased completion token.
pub type Token = Arc<dyn CompletionToken>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Failed(String),
}

impl EventStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Failed(_))
    }
}

/// Event signalled by the command queue when a command finishes.
///
/// Clones refer to the same event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    command: &'static str,
    status: Mutex<EventStatus>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new(command: &'static str) -> Self {
        Self {
            inner: Arc::new(EventInner {
                command,
                status: Mutex::new(EventStatus::Queued),
                cond: Condvar::new(),
            }),
        }
    }

    /// Name of the command this event belongs to.
    pub fn command(&self) -> &'static str {
        self.inner.command
    }

    pub fn status(&self) -> EventStatus {
        self.inner.status.lock().clone()
    }

    pub(crate) fn set_running(&self) {
        let mut status = self.inner.status.lock();
        if !status.is_terminal() {
            *status = EventStatus::Running;
        }
    }

    pub(crate) fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.finish(EventStatus::Failed(reason.into()));
    }

    fn finish(&self, outcome: EventStatus) {
        let mut status = self.inner.status.lock();
        debug_assert!(!status.is_terminal(), "event signalled twice");
        *status = outcome;
        self.inner.cond.notify_all();
    }

    pub fn into_token(self) -> Token {
        Arc::new(self)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("command", &self.inner.command)
            .field("status", &self.status())
            .finish()
    }
}

impl CompletionToken for Event {
    fn wait(&self) -> Result<(), DeviceError> {
        let mut status = self.inner.status.lock();
        while !status.is_terminal() {
            self.inner.cond.wait(&mut status);
        }
        match &*status {
            EventStatus::Failed(reason) => Err(DeviceError::CommandFailed {
                command: self.inner.command,
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn is_ready(&self) -> bool {
        self.inner.status.lock().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_after_completion_from_other_thread() {
        let event = Event::new("write");
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.set_running();
            signaller.complete();
        });

        assert!(event.wait().is_ok());
        assert!(event.is_ready());
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_event_reports_command() {
        let event = Event::new("nd_range");
        event.fail("device lost");
        let err = event.wait().unwrap_err();
        assert!(matches!(err, DeviceError::CommandFailed { command: "nd_range", .. }));
        assert_eq!(event.status(), EventStatus::Failed("device lost".into()));
    }

    #[test]
    fn test_new_event_is_not_ready() {
        let event = Event::new("read");
        assert!(!event.is_ready());
        assert_eq!(event.status(), EventStatus::Queued);
    }
}
