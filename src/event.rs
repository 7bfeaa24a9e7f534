//! Events — the happens-before graph between commands.
//!
//! Status runs monotonically Queued(3) → Submitted(2) → Running(1) →
//! Complete(0), with a jump to any negative error allowed from any
//! state. A mutex+condvar pair carries the state; callbacks are invoked
//! outside the lock so a callback may re-enter the queue.

use std::sync::{Condvar, Mutex};

use crate::cl::*;
use crate::context::Context;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};
use crate::queue::CommandQueue;

/// Status-change observer; receives the status that crossed the trigger.
pub type Callback = Box<dyn FnOnce(cl_int) + Send>;

struct EventState {
    status: cl_int,
    callbacks: Vec<(cl_int, Callback)>,
}

#[repr(C)]
pub struct Event {
    base: ObjectBase,
    context: Ref<Context>,
    /// Absent for user events.
    queue: Option<Ref<CommandQueue>>,
    state: Mutex<EventState>,
    completed: Condvar,
}

impl ClObject for Event {
    const KIND: HandleKind = HandleKind::Event;
    const INVALID_HANDLE: cl_int = CL_INVALID_EVENT;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

impl Event {
    /// An event tracking a queued command.
    pub fn new(queue: &CommandQueue) -> Ref<Event> {
        Ref::new(Event {
            base: ObjectBase::new(HandleKind::Event),
            context: Ref::from_ref(queue.context()),
            queue: Some(Ref::from_ref(queue)),
            state: Mutex::new(EventState {
                status: CL_QUEUED,
                callbacks: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    /// A user event; starts at Submitted and is driven by the client.
    pub fn new_user(context: &Context) -> Ref<Event> {
        Ref::new(Event {
            base: ObjectBase::new(HandleKind::Event),
            context: Ref::from_ref(context),
            queue: None,
            state: Mutex::new(EventState {
                status: CL_SUBMITTED,
                callbacks: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn command_queue(&self) -> Option<&CommandQueue> {
        self.queue.as_deref()
    }

    pub fn is_user_event(&self) -> bool {
        self.queue.is_none()
    }

    pub fn status(&self) -> cl_int {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn is_complete(&self) -> bool {
        self.status() <= CL_COMPLETE
    }

    /// Move the status toward completion. Upward moves and changes after
    /// a terminal error are ignored; the callbacks whose trigger boundary
    /// was crossed fire exactly once, after the lock is dropped.
    pub fn set_status(&self, new_status: cl_int) {
        let due = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // Complete and error states are terminal.
            if state.status <= CL_COMPLETE || new_status >= state.status {
                return;
            }
            state.status = new_status;

            let mut due = Vec::new();
            let mut index = 0;
            while index < state.callbacks.len() {
                let fires = new_status < CL_COMPLETE || new_status <= state.callbacks[index].0;
                if fires {
                    due.push(state.callbacks.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };

        if new_status <= CL_COMPLETE {
            self.completed.notify_all();
        }

        for (_, callback) in due {
            callback(new_status);
        }
    }

    /// Register `callback` to fire when the status reaches
    /// `trigger_status` (or errors out). Fires immediately when the
    /// boundary is already behind.
    pub fn set_callback(&self, trigger_status: cl_int, callback: Callback) {
        let fire_now = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status < CL_COMPLETE || state.status <= trigger_status {
                Some(state.status)
            } else {
                state.callbacks.push((trigger_status, callback));
                return;
            }
        };

        if let Some(status) = fire_now {
            callback(status);
        }
    }

    /// Block until the event reaches Complete or an error status.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.status > CL_COMPLETE {
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Client-side completion of a user event; `status` must be Complete
    /// or negative, and only the first transition counts.
    pub fn set_user_status(&self, status: cl_int) -> ClResult<()> {
        if !self.is_user_event() {
            return Err(CL_INVALID_EVENT);
        }
        if status > CL_COMPLETE {
            return Err(CL_INVALID_VALUE);
        }
        self.set_status(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn user_event() -> Option<Ref<Event>> {
        let ctx = Context::new().ok()?;
        Some(Event::new_user(&ctx))
    }

    #[test]
    fn test_user_event_starts_submitted() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };
        assert_eq!(event.status(), CL_SUBMITTED);
        assert!(event.is_user_event());
    }

    #[test]
    fn test_status_is_monotone() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        event.set_status(CL_RUNNING);
        assert_eq!(event.status(), CL_RUNNING);

        // Upward move is ignored.
        event.set_status(CL_QUEUED);
        assert_eq!(event.status(), CL_RUNNING);

        event.set_status(CL_COMPLETE);
        assert_eq!(event.status(), CL_COMPLETE);

        // Terminal states never change.
        event.set_status(-42);
        assert_eq!(event.status(), CL_COMPLETE);
    }

    #[test]
    fn test_negative_jump_from_any_state() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        event.set_status(-7);
        assert_eq!(event.status(), -7);
        assert!(event.is_complete());
    }

    #[test]
    fn test_callback_fires_exactly_once() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicI32::new(i32::MIN));
        {
            let fired = Arc::clone(&fired);
            let seen = Arc::clone(&seen);
            event.set_callback(
                CL_COMPLETE,
                Box::new(move |status| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    seen.store(status, Ordering::SeqCst);
                }),
            );
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        event.set_status(CL_RUNNING);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        event.set_status(CL_COMPLETE);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), CL_COMPLETE);
    }

    #[test]
    fn test_late_callback_fires_immediately() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        event.set_status(CL_COMPLETE);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        event.set_callback(CL_COMPLETE, Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_fires_complete_callbacks() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = Arc::clone(&seen);
        event.set_callback(CL_COMPLETE, Box::new(move |status| {
            seen2.store(status, Ordering::SeqCst);
        }));

        event.set_status(CL_OUT_OF_RESOURCES);
        assert_eq!(seen.load(Ordering::SeqCst), CL_OUT_OF_RESOURCES);
    }

    #[test]
    fn test_wait_unblocks_on_completion() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || {
                event.wait();
                event.status()
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        event.set_user_status(CL_COMPLETE).unwrap();
        assert_eq!(waiter.join().unwrap(), CL_COMPLETE);
    }

    #[test]
    fn test_user_status_validation() {
        let Some(event) = user_event() else {
            println!("no device, skipping");
            return;
        };

        assert_eq!(event.set_user_status(CL_RUNNING).err(), Some(CL_INVALID_VALUE));
        assert!(event.set_user_status(CL_COMPLETE).is_ok());
    }
}
