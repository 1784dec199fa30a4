use std::fmt;

use racetrap_disasm::ScanError;
use racetrap_elf::ElfError;
use racetrap_target::{Registers, TargetError};
use thiserror::Error;

use crate::thread::ThreadId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no threads registered")]
    NoThreads,

    #[error("thread capacity of {0} exceeded")]
    TooManyThreads(usize),

    #[error("no function resolved at {0:#x}")]
    Unresolved(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("semaphore start value {value} exceeds maximum {max}")]
    SemaphoreRange { value: u32, max: u32 },

    #[error("no thread is current")]
    NoCurrentThread,

    #[error("selector picked {index} out of {count} candidates")]
    SelectorOutOfRange { index: usize, count: usize },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Symbols(#[from] ElfError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("{0}")]
    Fault(Box<Fault>),
}

impl EngineError {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            EngineError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// What went wrong in the traced child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Fatal signal, including failed assertions (abort)
    Crash { signal: i32 },
    /// Stop the engine cannot explain
    UnexpectedStop { signal: i32 },
    UnexpectedSyscall,
    UnexpectedStep,
    UnexpectedExit { status: i32 },
    /// Every live thread is blocked
    Deadlock { blocked: usize },
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Crash { signal } => write!(f, "crash ({})", signal_name(*signal)),
            FaultKind::UnexpectedStop { signal } => write!(f, "unexpected stop ({})", signal_name(*signal)),
            FaultKind::UnexpectedSyscall => write!(f, "unexpected syscall stop"),
            FaultKind::UnexpectedStep => write!(f, "unexpected single-step stop"),
            FaultKind::UnexpectedExit { status } => write!(f, "child exited with status {}", status),
            FaultKind::Deadlock { blocked } => write!(f, "deadlock: all {} live threads are blocked", blocked),
        }
    }
}

fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        libc::SIGTRAP => "SIGTRAP",
        _ => return format!("signal {}", signal),
    };
    name.to_string()
}

/// A failed round, with enough context to reproduce and debug it.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub round: u64,
    pub addr: u64,
    pub thread: Option<ThreadId>,
    /// Symbolized frames, innermost first
    pub backtrace: Vec<String>,
    pub registers: Option<Registers>,
    /// Thread chosen at every context switch of the round
    pub schedule: Vec<ThreadId>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in round {}", self.kind, self.round)?;
        if let Some(thread) = self.thread {
            write!(f, ", thread {}", thread)?;
        }
        if self.addr != 0 {
            write!(f, ", at {:#x}", self.addr)?;
        }
        if !self.backtrace.is_empty() {
            write!(f, "\nbacktrace:")?;
            for (i, frame) in self.backtrace.iter().enumerate() {
                write!(f, "\n  #{} {}", i, frame)?;
            }
        }
        if let Some(regs) = &self.registers {
            write!(f, "\nregisters:\n{}", regs)?;
        }
        if !self.schedule.is_empty() {
            let ids: Vec<String> = self.schedule.iter().map(|t| t.to_string()).collect();
            write!(f, "\nschedule: {}", ids.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_report() {
        let fault = Fault {
            kind: FaultKind::Crash { signal: libc::SIGABRT },
            round: 3,
            addr: 0x4010,
            thread: Some(ThreadId(1)),
            backtrace: vec!["abort+0x12".to_string(), "worker+0x40".to_string()],
            registers: None,
            schedule: vec![ThreadId(0), ThreadId(1)],
        };
        let text = fault.to_string();
        assert_eq!(
            text,
            "crash (SIGABRT) in round 3, thread T1, at 0x4010\nbacktrace:\n  #0 abort+0x12\n  #1 worker+0x40\nschedule: T0 T1"
        );
        let err = EngineError::Fault(Box::new(fault));
        assert_eq!(err.fault().unwrap().round, 3);
        assert!(err.to_string().starts_with("crash (SIGABRT)"));
    }

    #[test]
    fn test_deadlock_message() {
        assert_eq!(FaultKind::Deadlock { blocked: 2 }.to_string(), "deadlock: all 2 live threads are blocked");
        assert_eq!(FaultKind::Crash { signal: 99 }.to_string(), "crash (signal 99)");
    }
}
