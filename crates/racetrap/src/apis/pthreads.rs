//! pthread mutexes and POSIX semaphores, emulated on [`Semaphore`].
//!
//! Each intercepted call is skipped in the child: the thread returns straight
//! to its caller with the emulated result in the return register, and any
//! blocking happens in the scheduler instead. Objects are keyed by their
//! address, the first call argument.

use std::rc::Rc;

use racetrap_common::debug::{create_logger, Logger};
use racetrap_common::{log, log_detail};
use racetrap_target::PtraceEvent;

use crate::controller::Controller;
use crate::error::EngineError;
use crate::handler::FunctionHandler;
use crate::semaphore::Semaphore;
use crate::session::Session;

/// Largest value of a counting semaphore.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

const FAILED: u64 = -1i64 as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncCall {
    MutexInit,
    MutexLock,
    MutexTryLock,
    MutexUnlock,
    ThreadSelf,
    SemInit,
    SemWait,
    SemTryWait,
    SemPost,
    SemDestroy,
}

impl SyncCall {
    pub const ALL: [SyncCall; 10] = [
        SyncCall::MutexInit,
        SyncCall::MutexLock,
        SyncCall::MutexTryLock,
        SyncCall::MutexUnlock,
        SyncCall::ThreadSelf,
        SyncCall::SemInit,
        SyncCall::SemWait,
        SyncCall::SemTryWait,
        SyncCall::SemPost,
        SyncCall::SemDestroy,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            SyncCall::MutexInit => "pthread_mutex_init",
            SyncCall::MutexLock => "pthread_mutex_lock",
            SyncCall::MutexTryLock => "pthread_mutex_trylock",
            SyncCall::MutexUnlock => "pthread_mutex_unlock",
            SyncCall::ThreadSelf => "pthread_self",
            SyncCall::SemInit => "sem_init",
            SyncCall::SemWait => "sem_wait",
            SyncCall::SemTryWait => "sem_trywait",
            SyncCall::SemPost => "sem_post",
            SyncCall::SemDestroy => "sem_destroy",
        }
    }
}

/// Handler for one intercepted entry point.
pub struct SyncInterceptor {
    call: SyncCall,
    log: Logger,
}

impl SyncInterceptor {
    pub fn new(call: SyncCall) -> Self {
        Self { call, log: create_logger("sync") }
    }

    pub fn call(&self) -> SyncCall {
        self.call
    }

    /// Whether the object at `key` may be reset. One with queued waiters is
    /// kept as is, so the waiters can still be woken, and the misuse is
    /// reported.
    fn replaceable(&self, session: &mut Session<'_>, key: u64) -> bool {
        let waiting = session.semaphore(key).map_or(0, |sem| sem.waiters().count());
        if waiting == 0 {
            return true;
        }
        session.report_error(format!("{} on {:#x} with {} waiting threads", self.call.symbol(), key, waiting));
        false
    }

    /// Return `value` to the caller without running the function body.
    fn finish(session: &mut Session<'_>, value: u64) -> Result<(), EngineError> {
        session.set_return_value(value)?;
        session.return_from_call()
    }
}

/// Uninitialized mutexes are free; uninitialized semaphores hold no permit.
fn mutex() -> Semaphore {
    Semaphore::binary()
}

fn counting() -> Semaphore {
    Semaphore::empty(SEM_VALUE_MAX)
}

impl FunctionHandler for SyncInterceptor {
    fn handle(&self, session: &mut Session<'_>, _addr: u64, _event: &PtraceEvent) -> Result<(), EngineError> {
        let object = session.argument(0)?;
        let thread = session.current_thread().map(|t| t.id()).ok_or(EngineError::NoCurrentThread)?;
        log_detail!(self.log, "{} {}({:#x})", thread, self.call.symbol(), object);

        // The result is written before any wait or signal: either can switch
        // the current thread.
        match self.call {
            SyncCall::MutexInit => {
                if !self.replaceable(session, object) {
                    return Self::finish(session, libc::EBUSY as u64);
                }
                Self::finish(session, 0)?;
                session.set_semaphore(object, mutex());
            }
            SyncCall::MutexLock => {
                Self::finish(session, 0)?;
                let acquired = session.with_semaphore(object, mutex, |sem, s| sem.wait(s))?;
                if !acquired {
                    log!(self.log, "{} blocked on mutex {:#x}", thread, object);
                }
            }
            SyncCall::MutexTryLock => {
                let acquired = session.with_semaphore(object, mutex, |sem, _| Ok(sem.try_wait()))?;
                Self::finish(session, if acquired { 0 } else { libc::EBUSY as u64 })?;
            }
            SyncCall::MutexUnlock => {
                Self::finish(session, 0)?;
                session.with_semaphore(object, mutex, |sem, s| sem.signal(s))?;
            }
            SyncCall::ThreadSelf => {
                // libc itself passes this handle to raise and pthread_kill, so
                // it must stay the real thread pointer of the child.
                let handle = session.current_thread().map(|t| t.registers().fs_base).unwrap_or_default();
                Self::finish(session, handle)?;
            }
            SyncCall::SemInit => {
                let value = session.argument(2)? as u32;
                if value > SEM_VALUE_MAX || !self.replaceable(session, object) {
                    return Self::finish(session, FAILED);
                }
                Self::finish(session, 0)?;
                session.set_semaphore(object, Semaphore::with_value(value, SEM_VALUE_MAX)?);
            }
            SyncCall::SemWait => {
                Self::finish(session, 0)?;
                let acquired = session.with_semaphore(object, counting, |sem, s| sem.wait(s))?;
                if !acquired {
                    log!(self.log, "{} blocked on semaphore {:#x}", thread, object);
                }
            }
            SyncCall::SemTryWait => {
                let acquired = session.with_semaphore(object, counting, |sem, _| Ok(sem.try_wait()))?;
                Self::finish(session, if acquired { 0 } else { FAILED })?;
            }
            SyncCall::SemPost => {
                Self::finish(session, 0)?;
                session.with_semaphore(object, counting, |sem, s| sem.signal(s))?;
            }
            SyncCall::SemDestroy => {
                if !self.replaceable(session, object) {
                    return Self::finish(session, FAILED);
                }
                Self::finish(session, 0)?;
                session.remove_semaphore(object);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        self.call.symbol()
    }
}

/// Runtime addresses of the intercepted functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntryPoints {
    pub entries: Vec<(SyncCall, u64)>,
}

impl SyncEntryPoints {
    /// The C library functions this binary links against.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn libc() -> Self {
        let entries = vec![
            (SyncCall::MutexInit, libc::pthread_mutex_init as usize as u64),
            (SyncCall::MutexLock, libc::pthread_mutex_lock as usize as u64),
            (SyncCall::MutexTryLock, libc::pthread_mutex_trylock as usize as u64),
            (SyncCall::MutexUnlock, libc::pthread_mutex_unlock as usize as u64),
            (SyncCall::ThreadSelf, libc::pthread_self as usize as u64),
            (SyncCall::SemInit, libc::sem_init as usize as u64),
            (SyncCall::SemWait, libc::sem_wait as usize as u64),
            (SyncCall::SemTryWait, libc::sem_trywait as usize as u64),
            (SyncCall::SemPost, libc::sem_post as usize as u64),
            (SyncCall::SemDestroy, libc::sem_destroy as usize as u64),
        ];
        Self { entries }
    }

    pub fn get(&self, call: SyncCall) -> Option<u64> {
        self.entries.iter().find(|(c, _)| *c == call).map(|(_, addr)| *addr)
    }
}

/// Register a [`SyncInterceptor`] at every entry point, and at every other
/// function sharing its name.
pub fn install_sync_handlers(ctl: &mut Controller, points: &SyncEntryPoints) -> Result<(), EngineError> {
    for &(call, addr) in &points.entries {
        ctl.register_function_handler(addr, Rc::new(SyncInterceptor::new(call)))?;
    }
    Ok(())
}
