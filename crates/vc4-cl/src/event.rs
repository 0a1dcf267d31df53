//! # Events
//!
//! Completion state of one command, or a user-controlled marker. Status moves
//! forward only (`Queued → Submitted → Running → Complete | Error`) and the
//! terminal transition happens once. Waiters block on a condition variable;
//! the engine is woken on every terminal transition so commands waiting on
//! the event are reconsidered.

use std::sync::{Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use vc4_core::{Error, Handle, Result};

use crate::context::Context;
use crate::engine::EngineShared;
use crate::info::InfoValue;
use crate::queue::CommandQueue;
use crate::status::{ExecutionStatus, Status};

/// Command type of a user event
pub const COMMAND_USER: u32 = 0x1204;

/// Completion state of a command or user event
#[derive(Debug)]
pub struct Event {
    context: Handle<Context>,
    queue: Option<Handle<CommandQueue>>,
    command_type: u32,
    user: bool,
    status: Mutex<ExecutionStatus>,
    changed: Condvar,
    engine: Weak<EngineShared>,
}

impl Event {
    /// Event for a command enqueued on `queue`
    pub(crate) fn for_command(
        context: Handle<Context>,
        queue: Handle<CommandQueue>,
        command_type: u32,
        engine: Weak<EngineShared>,
    ) -> Self {
        Self {
            context,
            queue: Some(queue),
            command_type,
            user: false,
            status: Mutex::new(ExecutionStatus::Queued),
            changed: Condvar::new(),
            engine,
        }
    }

    /// User event, completed by the host
    pub(crate) fn user(context: Handle<Context>, engine: Weak<EngineShared>) -> Self {
        Self {
            context,
            queue: None,
            command_type: COMMAND_USER,
            user: true,
            status: Mutex::new(ExecutionStatus::Submitted),
            changed: Condvar::new(),
            engine,
        }
    }

    /// Owning context
    pub fn context(&self) -> Handle<Context> {
        self.context
    }

    /// Whether the host sets this event's status
    pub fn is_user(&self) -> bool {
        self.user
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current status, without blocking on completion
    pub fn status(&self) -> ExecutionStatus {
        *self.lock()
    }

    /// Move forward to `next`
    ///
    /// Backward moves and moves out of a terminal state are ignored. Returns
    /// whether the status changed.
    pub(crate) fn advance(&self, next: ExecutionStatus) -> bool {
        {
            let mut status = self.lock();
            if status.is_terminal() || next.rank() <= status.rank() {
                return false;
            }
            *status = next;
            if !next.is_terminal() {
                return true;
            }
            self.changed.notify_all();
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.notify();
        }
        true
    }

    /// Complete a user event with `CL_COMPLETE` (0) or a negative error
    pub fn set_user_status(&self, raw: i32) -> Result<()> {
        if !self.user {
            return Err(Error::InvalidEvent);
        }
        let next = match raw {
            0 => ExecutionStatus::Complete,
            r if r < 0 => ExecutionStatus::Error(Status::from_raw(r).unwrap_or(Status::OutOfResources)),
            _ => return Err(Error::InvalidValue),
        };
        if self.advance(next) {
            Ok(())
        } else {
            Err(Error::InvalidOperation)
        }
    }

    /// Block until terminal or until `timeout` elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Result<ExecutionStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.lock();
        while !status.is_terminal() {
            status = match deadline {
                None => self
                    .changed
                    .wait(status)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.changed
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        Ok(*status)
    }

    /// Answer an event query other than the reference count
    pub fn info(&self, param: u32) -> Result<InfoValue> {
        use crate::info::event::*;
        match param {
            COMMAND_QUEUE => Ok(InfoValue::Handle(self.queue.map_or(0, |q| q.raw()))),
            COMMAND_TYPE => Ok(InfoValue::U32(self.command_type)),
            COMMAND_EXECUTION_STATUS => Ok(InfoValue::I32(self.status().as_raw())),
            CONTEXT => Ok(InfoValue::Handle(self.context.raw())),
            _ => Err(Error::InvalidValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn user_event() -> Event {
        Event::user(Handle::from_parts(0, 1), Weak::new())
    }

    #[test]
    fn test_status_is_monotonic() {
        let event = Event::for_command(Handle::from_parts(0, 1), Handle::from_parts(0, 1), 0x11F0, Weak::new());
        assert_eq!(event.status(), ExecutionStatus::Queued);
        assert!(event.advance(ExecutionStatus::Running));
        assert!(!event.advance(ExecutionStatus::Submitted));
        assert!(event.advance(ExecutionStatus::Complete));
        assert!(!event.advance(ExecutionStatus::Error(Status::OutOfResources)));
        assert_eq!(event.status(), ExecutionStatus::Complete);
    }

    #[test]
    fn test_user_status_set_once() {
        let event = user_event();
        assert_eq!(event.status(), ExecutionStatus::Submitted);
        assert_eq!(event.set_user_status(1), Err(Error::InvalidValue));
        assert_eq!(event.set_user_status(0), Ok(()));
        assert_eq!(event.set_user_status(0), Err(Error::InvalidOperation));
        assert_eq!(event.set_user_status(-5), Err(Error::InvalidOperation));
    }

    #[test]
    fn test_user_error_status() {
        let event = user_event();
        event.set_user_status(Status::InvalidValue.as_raw()).unwrap();
        assert_eq!(event.status(), ExecutionStatus::Error(Status::InvalidValue));
    }

    #[test]
    fn test_command_event_rejects_user_status() {
        let event = Event::for_command(Handle::from_parts(0, 1), Handle::from_parts(0, 1), 0x11F0, Weak::new());
        assert_eq!(event.set_user_status(0), Err(Error::InvalidEvent));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let event = Arc::new(user_event());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(None))
        };
        thread::sleep(Duration::from_millis(10));
        event.set_user_status(0).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(ExecutionStatus::Complete));
    }

    #[test]
    fn test_wait_timeout() {
        let event = user_event();
        assert_eq!(event.wait(Some(Duration::from_millis(5))), Err(Error::Timeout));
        event.set_user_status(0).unwrap();
        assert_eq!(event.wait(Some(Duration::ZERO)), Ok(ExecutionStatus::Complete));
    }

    #[test]
    fn test_info() {
        let event = user_event();
        assert_eq!(event.info(crate::info::event::COMMAND_TYPE), Ok(InfoValue::U32(COMMAND_USER)));
        assert_eq!(event.info(crate::info::event::COMMAND_QUEUE), Ok(InfoValue::Handle(0)));
        assert_eq!(event.info(0xDEAD), Err(Error::InvalidValue));
    }
}
