//! Interception of library calls the child must not execute for real.

pub mod pthreads;

pub use pthreads::{install_sync_handlers, SyncCall, SyncEntryPoints, SyncInterceptor};
