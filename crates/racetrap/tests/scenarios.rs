//! End-to-end rounds against the real kernel.
//!
//! These fork and trace the test binary itself, so they need ptrace
//! permission (a relaxed `kernel.yama.ptrace_scope` or CAP_SYS_PTRACE).
//! Run with `cargo test -p racetrap --test scenarios -- --ignored`.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ptr::addr_of_mut;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use racetrap::{Controller, EngineConfig, EngineError, FaultKind, SelectorConfig, Session};

static COUNTER: AtomicU64 = AtomicU64::new(0);
static GLOBAL: AtomicU64 = AtomicU64::new(0);
static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

fn config(runs: u64) -> EngineConfig {
    EngineConfig::default()
        .with_runs(runs)
        .with_stack_size(256 * 1024)
        .with_selector(SelectorConfig::Random { seed: Some(0x5eed) })
}

extern "C" fn hello(arg: usize) -> i32 {
    arg as i32
}

#[inline(never)]
extern "C" fn racy_increment(_arg: usize) -> i32 {
    let v = COUNTER.load(Ordering::Relaxed);
    COUNTER.store(v + 1, Ordering::Relaxed);
    0
}

#[inline(never)]
fn add(x: u64) -> u64 {
    let v = GLOBAL.load(Ordering::Relaxed) + x;
    GLOBAL.store(v, Ordering::Relaxed);
    v
}

extern "C" fn guarded(_arg: usize) -> i32 {
    unsafe {
        libc::pthread_mutex_lock(addr_of_mut!(MUTEX));
    }
    GLOBAL.store(1, Ordering::Relaxed);
    assert_eq!(GLOBAL.load(Ordering::Relaxed), 1);
    let v = add(1);
    assert_eq!(v, 2);
    unsafe {
        libc::pthread_mutex_unlock(addr_of_mut!(MUTEX));
    }
    0
}

extern "C" fn aborts(_arg: usize) -> i32 {
    std::process::abort()
}

#[test]
#[ignore = "needs ptrace"]
fn hello_threads_complete() {
    let mut ctl = Controller::for_current_process_with(config(5)).unwrap();
    ctl.add_thread(hello, 1).unwrap();
    ctl.add_thread(hello, 2).unwrap();
    let summary = ctl.run().unwrap();
    assert_eq!(summary.rounds, 5);
}

#[test]
#[ignore = "needs ptrace"]
fn racy_counter_loses_updates() {
    let mut ctl = Controller::for_current_process_with(config(200)).unwrap();
    ctl.add_thread(racy_increment, 0).unwrap();
    ctl.add_thread(racy_increment, 1).unwrap();
    let outcomes = Rc::new(RefCell::new(BTreeSet::new()));
    let seen = Rc::clone(&outcomes);
    ctl.set_round_observer(move |session: &Session<'_>| -> Result<(), EngineError> {
        let value = session.process().read_word(&COUNTER as *const AtomicU64 as u64)?;
        seen.borrow_mut().insert(value);
        Ok(())
    });

    ctl.run().unwrap();
    assert_eq!(*outcomes.borrow(), BTreeSet::from([1, 2]));
}

#[test]
#[ignore = "needs ptrace"]
fn mutex_guarded_body_never_fails() {
    let mut ctl = Controller::for_current_process_with(config(10)).unwrap();
    ctl.add_thread(guarded, 0).unwrap();
    ctl.add_thread(guarded, 1).unwrap();
    ctl.run().unwrap();
    assert!(ctl.error().is_none());
}

#[test]
#[ignore = "needs ptrace"]
fn abort_is_a_crash() {
    let mut ctl = Controller::for_current_process_with(config(1)).unwrap();
    ctl.add_thread(aborts, 0).unwrap();
    let err = ctl.run().unwrap_err();
    assert_eq!(err.fault().unwrap().kind, FaultKind::Crash { signal: libc::SIGABRT });
}
