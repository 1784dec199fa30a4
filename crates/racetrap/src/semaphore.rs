//! Counting semaphores emulated on top of the scheduler.
//!
//! Blocking never happens in the child. A waiting thread is marked blocked
//! and the scheduler moves on; a signal makes it runnable again.

use std::collections::VecDeque;

use crate::error::EngineError;
use crate::thread::ThreadId;

/// What a semaphore needs from the scheduler.
pub trait Scheduling {
    fn current_thread_id(&self) -> Option<ThreadId>;
    fn set_blocked(&mut self, thread: ThreadId, blocked: bool);
    /// Pick the next thread to run now, without resuming the child.
    fn force_reschedule(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semaphore {
    value: u32,
    max_value: u32,
    waiters: VecDeque<ThreadId>,
}

impl Semaphore {
    /// A semaphore starting and capped at `max_value`.
    pub fn new(max_value: u32) -> Self {
        Self { value: max_value, max_value, waiters: VecDeque::new() }
    }

    /// A mutex: one permit, initially available.
    pub fn binary() -> Self {
        Self::new(1)
    }

    /// A semaphore capped at `max_value` with no permit available.
    pub fn empty(max_value: u32) -> Self {
        Self { value: 0, max_value, waiters: VecDeque::new() }
    }

    pub fn with_value(value: u32, max_value: u32) -> Result<Self, EngineError> {
        if value > max_value {
            return Err(EngineError::SemaphoreRange { value, max: max_value });
        }
        Ok(Self { value, max_value, waiters: VecDeque::new() })
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn max_value(&self) -> u32 {
        self.max_value
    }

    pub fn waiters(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().copied()
    }

    /// Take a permit, blocking the current thread if none is available.
    /// Returns whether the permit was taken without blocking. A blocked
    /// thread owns the permit once a signal wakes it.
    pub fn wait(&mut self, sched: &mut dyn Scheduling) -> Result<bool, EngineError> {
        if self.value > 0 {
            self.value -= 1;
            return Ok(true);
        }
        let thread = sched.current_thread_id().ok_or(EngineError::NoCurrentThread)?;
        sched.set_blocked(thread, true);
        self.waiters.push_back(thread);
        sched.force_reschedule()?;
        Ok(false)
    }

    /// Release a permit. When a thread is waiting the permit passes to it
    /// directly and the scheduler runs immediately.
    pub fn signal(&mut self, sched: &mut dyn Scheduling) -> Result<(), EngineError> {
        if self.value == self.max_value {
            return Ok(());
        }
        if self.value == 0 {
            if let Some(waiter) = self.waiters.pop_front() {
                sched.set_blocked(waiter, false);
                sched.force_reschedule()?;
                return Ok(());
            }
        }
        self.value += 1;
        Ok(())
    }

    /// Take a permit if one is available. Never blocks.
    pub fn try_wait(&mut self) -> bool {
        if self.value == 0 {
            return false;
        }
        self.value -= 1;
        true
    }
}
