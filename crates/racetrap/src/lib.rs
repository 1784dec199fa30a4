//! Deterministic exploration of thread interleavings.
//!
//! The engine runs a set of functions as synthetic threads inside a forked,
//! ptrace-controlled copy of the current process. Every round starts a fresh
//! child; inside it exactly one thread runs at a time, and a pluggable
//! [`ThreadSelector`] decides who runs next at every instruction that touches
//! memory. Blocking synchronization is emulated by intercepting pthread and
//! POSIX semaphore calls, so the child itself never blocks.

pub mod apis;
pub mod breakpoints;
pub mod config;
pub mod controller;
pub mod error;
pub mod functions;
pub mod handler;
pub mod markers;
pub mod selector;
pub mod semaphore;
pub mod session;
pub mod thread;

pub use config::{EngineConfig, SelectorConfig};
pub use controller::{Controller, RoundObserver, RunSummary, MAX_THREADS};
pub use error::{EngineError, Fault, FaultKind};
pub use handler::FunctionHandler;
pub use selector::{BucketSelector, RandomSelector, ThreadSelector};
pub use semaphore::{Scheduling, Semaphore};
pub use session::{Session, SessionState};
pub use thread::{Thread, ThreadFn, ThreadId};
