use racetrap_common::log;
use racetrap_target::PtraceEvent;

use crate::error::EngineError;
use crate::session::Session;

/// Invoked when a thread traps on an address the handler is registered for.
///
/// The trapping thread is the session's current thread and its registers are
/// already saved, with the pc at `addr`. A handler decides everything that
/// happens next: it may rewrite the thread's registers, block it, remove it
/// or pick another thread.
pub trait FunctionHandler {
    fn handle(&self, session: &mut Session<'_>, addr: u64, event: &PtraceEvent) -> Result<(), EngineError>;

    fn name(&self) -> &str {
        "handler"
    }
}

/// Removes a thread whose function has returned.
pub(crate) struct ThreadExitHandler;

impl FunctionHandler for ThreadExitHandler {
    fn handle(&self, session: &mut Session<'_>, _addr: u64, _event: &PtraceEvent) -> Result<(), EngineError> {
        let index = session.current_index().ok_or(EngineError::NoCurrentThread)?;
        let thread = session.remove_thread(index);
        log!(session.log, "{} returned {}", thread.id(), thread.return_value() as i32);

        match session.live_count() {
            0 => session.complete(),
            remaining => {
                session.force_reschedule()?;
                if remaining == 1 {
                    session.enter_fast_path()?;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "thread-exit"
    }
}
