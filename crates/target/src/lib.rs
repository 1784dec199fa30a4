//! Control of the traced child process.
//!
//! The engine talks to the child only through [`ProcessControl`]. The Linux
//! implementation ([`ptrace::PtraceProcess`]) forks the current process and
//! drives the copy with ptrace; [`scripted::ScriptedProcess`] replays a fixed
//! list of stops and is used for dry runs and tests.

pub mod arch;
pub mod error;
pub mod event;
pub mod process;
pub mod registers;
pub mod scripted;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;

pub use arch::{ArchInfo, X86_64};
pub use error::TargetError;
pub use event::{BreakpointId, EventKind, PtraceEvent};
pub use process::ProcessControl;
pub use registers::Registers;
pub use scripted::{Call, CallLog, ScriptedProcess, Stop};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceProcess;
