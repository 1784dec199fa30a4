//! Stop descriptions reported by process control.

use std::fmt;

/// Identifier handed out by process control for an armed breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

/// Why the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Trapped on an armed breakpoint
    Breakpoint,
    /// A single step completed
    Step,
    /// Stopped at a system call boundary
    Syscall,
    /// Fatal signal (segfault, abort, illegal instruction, ...)
    Crash,
    /// A stop the tracer could not classify
    Error,
    /// The child exited or was killed
    Exit,
}

/// One stop of the traced child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtraceEvent {
    pub kind: EventKind,
    /// Breakpoint address for traps, faulting pc for crashes
    pub addr: u64,
    pub breakpoint: Option<BreakpointId>,
    /// Stop signal, or exit status for [`EventKind::Exit`]
    pub signal: Option<i32>,
}

impl PtraceEvent {
    pub fn breakpoint(addr: u64, id: BreakpointId) -> Self {
        Self { kind: EventKind::Breakpoint, addr, breakpoint: Some(id), signal: None }
    }

    /// A breakpoint event that did not come from the child. Used when the
    /// engine reschedules on its own initiative.
    pub fn synthetic() -> Self {
        Self { kind: EventKind::Breakpoint, addr: 0, breakpoint: None, signal: None }
    }

    pub fn step(addr: u64) -> Self {
        Self { kind: EventKind::Step, addr, breakpoint: None, signal: None }
    }

    pub fn syscall(addr: u64) -> Self {
        Self { kind: EventKind::Syscall, addr, breakpoint: None, signal: None }
    }

    pub fn crash(addr: u64, signal: i32) -> Self {
        Self { kind: EventKind::Crash, addr, breakpoint: None, signal: Some(signal) }
    }

    pub fn error(addr: u64, signal: i32) -> Self {
        Self { kind: EventKind::Error, addr, breakpoint: None, signal: Some(signal) }
    }

    pub fn exit(status: i32) -> Self {
        Self { kind: EventKind::Exit, addr: 0, breakpoint: None, signal: Some(status) }
    }

    pub fn is_synthetic(&self) -> bool {
        self.kind == EventKind::Breakpoint && self.breakpoint.is_none()
    }
}

impl fmt::Display for PtraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Breakpoint if self.is_synthetic() => write!(f, "forced reschedule"),
            EventKind::Breakpoint => write!(f, "breakpoint at {:#x}", self.addr),
            EventKind::Step => write!(f, "step to {:#x}", self.addr),
            EventKind::Syscall => write!(f, "syscall stop at {:#x}", self.addr),
            EventKind::Crash => write!(f, "signal {} at {:#x}", self.signal.unwrap_or(0), self.addr),
            EventKind::Error => write!(f, "unexpected stop (signal {}) at {:#x}", self.signal.unwrap_or(0), self.addr),
            EventKind::Exit => write!(f, "exit with status {}", self.signal.unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_event() {
        let ev = PtraceEvent::synthetic();
        assert!(ev.is_synthetic());
        assert!(!PtraceEvent::breakpoint(0x1000, BreakpointId(3)).is_synthetic());
        assert_eq!(ev.to_string(), "forced reschedule");
    }

    #[test]
    fn test_event_display() {
        assert_eq!(PtraceEvent::crash(0x4010, 11).to_string(), "signal 11 at 0x4010");
        assert_eq!(PtraceEvent::exit(3).to_string(), "exit with status 3");
    }
}
