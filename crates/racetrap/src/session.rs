//! One round of exploration.
//!
//! A session forks a fresh child, runs every registered thread inside it to
//! completion under the scheduler, and tears the child down again. State
//! machine: `Init -> Running -> Completed | Failed`.

use std::rc::Rc;
use std::time::Instant;

use racetrap_common::debug::{create_logger, Logger};
use racetrap_common::{log, log_detail, log_dump, log_fail, log_success};
use racetrap_target::{EventKind, ProcessControl, PtraceEvent};

use crate::breakpoints::BreakpointRole;
use crate::controller::Controller;
use crate::error::{EngineError, Fault, FaultKind};
use crate::handler::ThreadExitHandler;
use crate::semaphore::{Scheduling, Semaphore};
use crate::thread::{Thread, ThreadId};

const MAX_BACKTRACE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Running,
    Completed,
    Failed,
}

pub struct Session<'c> {
    ctl: &'c mut Controller,
    threads: Vec<Thread>,
    /// Index into `threads` of the thread whose registers the child runs
    current: Option<usize>,
    pid: i32,
    state: SessionState,
    round: u64,
    /// Scheduler-lock depth at round start, restored at teardown
    lock_snapshot: u32,
    /// Start of the whole run; selectors see time elapsed since then
    run_started: Instant,
    /// Thread chosen at every context switch
    schedule: Vec<ThreadId>,
    /// Only one thread left: scheduling points are no longer armed
    fast_path: bool,
    torn_down: bool,
    pub(crate) log: Logger,
}

impl<'c> Session<'c> {
    /// Build the threads for a round. Stacks are allocated here, before the
    /// fork, so the child inherits them.
    pub fn new(ctl: &'c mut Controller, round: u64, run_started: Instant) -> Self {
        let exit_marker = ctl.exit_marker;
        let stack_size = ctl.config.stack_size;
        let threads = ctl
            .pending
            .iter()
            .enumerate()
            .map(|(i, p)| Thread::new(ThreadId(i as u32), p.entry, p.argument, stack_size, exit_marker))
            .collect();
        ctl.install_handler(exit_marker, Rc::new(ThreadExitHandler), BreakpointRole::ExitMarker);
        let lock_snapshot = ctl.scheduler_lock;

        Self {
            ctl,
            threads,
            current: None,
            pid: 0,
            state: SessionState::Init,
            round,
            lock_snapshot,
            run_started,
            schedule: Vec::new(),
            fast_path: false,
            torn_down: false,
            log: create_logger("session"),
        }
    }

    /// Run the round to completion. The child is always torn down, whatever
    /// the outcome.
    pub fn run(mut self) -> Result<(), EngineError> {
        let result = self.start().and_then(|()| self.event_loop()).and_then(|()| self.notify_observer());
        self.state = match result {
            Ok(()) => SessionState::Completed,
            Err(_) => SessionState::Failed,
        };
        self.teardown();
        result
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.pid = self.ctl.process.fork_and_attach()?;
        let host = self.ctl.process.save_registers()?;
        for thread in &mut self.threads {
            thread.adopt_process_state(&host);
        }
        self.ctl.semaphores.clear();

        for addr in self.ctl.breakpoints.pending() {
            self.arm(addr)?;
        }
        self.ctl.selector.round_started();
        self.state = SessionState::Running;
        log!(
            self.log,
            "round {}: child {}, {} threads, {} breakpoints armed",
            self.round,
            self.pid,
            self.threads.len(),
            self.ctl.breakpoints.armed_count()
        );

        let refs: Vec<&Thread> = self.threads.iter().collect();
        let elapsed = self.elapsed_micros();
        let pick = self.ctl.selector.select_thread(None, &refs, elapsed, None);
        if pick >= refs.len() {
            return Err(EngineError::SelectorOutOfRange { index: pick, count: refs.len() });
        }
        self.current = Some(pick);
        self.schedule.push(self.threads[pick].id());

        if self.threads.len() == 1 {
            self.enter_fast_path()?;
        }
        Ok(())
    }

    fn event_loop(&mut self) -> Result<(), EngineError> {
        while self.state == SessionState::Running {
            let event = self.resume()?;
            self.handle_event(event)?;
        }
        Ok(())
    }

    /// Load the current thread into the child and run it to the next stop.
    fn resume(&mut self) -> Result<PtraceEvent, EngineError> {
        let index = self.current.ok_or(EngineError::NoCurrentThread)?;
        let thread = &mut self.threads[index];
        let regs = *thread.registers();
        let fresh = thread.take_fresh();
        self.ctl.process.load_registers(&regs)?;

        let pc = regs.pc();
        if let Some(id) = self.ctl.breakpoints.armed_id(pc) {
            // A thread that has not run yet sits on its entry breakpoint
            // without having hit it.
            if fresh {
                return Ok(PtraceEvent::breakpoint(pc, id));
            }
            let event = self.ctl.process.step_over_breakpoint(pc)?;
            if event.kind != EventKind::Step {
                return Ok(event);
            }
        }
        Ok(self.ctl.process.continue_execution()?)
    }

    fn handle_event(&mut self, event: PtraceEvent) -> Result<(), EngineError> {
        let signal = event.signal.unwrap_or(0);
        match event.kind {
            EventKind::Breakpoint => self.handle_breakpoint(&event),
            EventKind::Crash => Err(self.fault(FaultKind::Crash { signal }, event.addr)),
            EventKind::Error => Err(self.fault(FaultKind::UnexpectedStop { signal }, event.addr)),
            EventKind::Syscall => Err(self.fault(FaultKind::UnexpectedSyscall, event.addr)),
            EventKind::Step => Err(self.fault(FaultKind::UnexpectedStep, event.addr)),
            EventKind::Exit => Err(self.fault(FaultKind::UnexpectedExit { status: signal }, 0)),
        }
    }

    fn handle_breakpoint(&mut self, event: &PtraceEvent) -> Result<(), EngineError> {
        let addr = event.addr;
        let index = self.current.ok_or(EngineError::NoCurrentThread)?;
        let mut regs = self.ctl.process.save_registers()?;
        regs.set_pc(addr);
        self.threads[index].set_registers(regs);
        log_detail!(self.log, "{} at {}", self.threads[index].id(), self.symbolize(addr));

        if let Some(handler) = self.ctl.handlers.get(&addr).cloned() {
            log_detail!(self.log, "dispatching to {}", handler.name());
            self.log.push_indent();
            let result = handler.handle(self, addr, event);
            self.log.pop_indent();
            return result;
        }
        match self.ctl.breakpoints.role(addr) {
            Some(BreakpointRole::FunctionEntry) => self.expand_function(addr),
            _ => self.scheduling_point(event),
        }
    }

    /// First visit of a function: trade its entry breakpoint for one at every
    /// instruction that touches memory.
    fn expand_function(&mut self, entry: u64) -> Result<(), EngineError> {
        self.disarm(entry)?;
        self.ctl.breakpoints.retire(entry);

        let Some(function) = self.ctl.functions.instrumentable(entry).cloned() else {
            return Ok(());
        };
        if !self.ctl.functions.mark_explored(entry) {
            return Ok(());
        }

        let code = self.ctl.process.read_memory(function.entry, function.size as usize)?;
        let offsets = match self.ctl.scanner.memory_references(&code, function.entry) {
            Ok(offsets) => offsets,
            Err(err) => {
                log_fail!(self.log, "cannot scan {}: {}", function.name, err);
                return Ok(());
            }
        };
        for offset in &offsets {
            let addr = function.entry + offset;
            self.ctl.breakpoints.insert(addr, BreakpointRole::MemoryReference);
            if !self.fast_path {
                self.arm(addr)?;
            }
        }
        log!(self.log, "explored {}: {} scheduling points", function.name, offsets.len());
        Ok(())
    }

    fn scheduling_point(&mut self, event: &PtraceEvent) -> Result<(), EngineError> {
        if self.ctl.scheduler_lock > 0 {
            log_detail!(self.log, "scheduler locked (depth {})", self.ctl.scheduler_lock);
            return Ok(());
        }
        self.switch_thread(event)
    }

    /// Ask the selector for the next thread among the unblocked ones.
    fn switch_thread(&mut self, event: &PtraceEvent) -> Result<(), EngineError> {
        let candidates: Vec<usize> = (0..self.threads.len()).filter(|&i| !self.threads[i].is_blocked()).collect();
        if candidates.is_empty() {
            let blocked = self.threads.len();
            return Err(self.fault(FaultKind::Deadlock { blocked }, event.addr));
        }

        let current = self.current.and_then(|c| candidates.iter().position(|&i| i == c));
        let elapsed = self.elapsed_micros();
        let refs: Vec<&Thread> = candidates.iter().map(|&i| &self.threads[i]).collect();
        let pick = self.ctl.selector.select_thread(current, &refs, elapsed, Some(event));
        if pick >= candidates.len() {
            return Err(EngineError::SelectorOutOfRange { index: pick, count: candidates.len() });
        }

        let next = candidates[pick];
        if Some(next) != self.current {
            let id = self.threads[next].id();
            log_detail!(self.log, "switch to {} ({})", id, event);
            self.schedule.push(id);
        }
        self.current = Some(next);
        Ok(())
    }

    fn elapsed_micros(&self) -> u64 {
        self.run_started.elapsed().as_micros() as u64
    }

    /// Make a scheduling decision now, regardless of the scheduler lock.
    pub fn force_reschedule(&mut self) -> Result<(), EngineError> {
        self.switch_thread(&PtraceEvent::synthetic())
    }

    fn arm(&mut self, addr: u64) -> Result<(), EngineError> {
        let id = self.ctl.process.set_breakpoint(addr)?;
        self.ctl.breakpoints.set_armed(addr, Some(id));
        Ok(())
    }

    fn disarm(&mut self, addr: u64) -> Result<(), EngineError> {
        if let Some(id) = self.ctl.breakpoints.armed_id(addr) {
            self.ctl.process.clear_breakpoint(id)?;
            self.ctl.breakpoints.set_armed(addr, None);
        }
        Ok(())
    }

    /// With a single thread left nothing can interleave: drop every
    /// scheduling point. Thread exit and intercepted calls stay trapped.
    pub(crate) fn enter_fast_path(&mut self) -> Result<(), EngineError> {
        if self.fast_path {
            return Ok(());
        }
        self.fast_path = true;
        let addrs = self.ctl.breakpoints.armed_except(&[BreakpointRole::ExitMarker, BreakpointRole::Handler]);
        for &addr in &addrs {
            self.disarm(addr)?;
        }
        log_detail!(self.log, "single thread left, disarmed {} breakpoints", addrs.len());
        Ok(())
    }

    fn fault(&mut self, kind: FaultKind, addr: u64) -> EngineError {
        let refresh = !matches!(kind, FaultKind::Deadlock { .. } | FaultKind::UnexpectedExit { .. });
        let mut registers = None;
        let mut backtrace = Vec::new();
        let thread = self.current.map(|i| self.threads[i].id());

        if let Some(index) = self.current {
            if refresh && self.ctl.process.is_running() {
                if let Ok(regs) = self.ctl.process.save_registers() {
                    self.threads[index].set_registers(regs);
                }
            }
            let current = &self.threads[index];
            registers = Some(*current.registers());
            if self.ctl.process.is_running() {
                backtrace = current
                    .backtrace(&*self.ctl.process, MAX_BACKTRACE)
                    .into_iter()
                    .map(|frame| format!("{:#x} {}", frame, self.ctl.functions.symbols().symbolize(frame)))
                    .collect();
            }
        }

        let fault = Fault { kind, round: self.round, addr, thread, backtrace, registers, schedule: self.schedule.clone() };
        log_fail!(self.log, "{}", fault.kind);
        if let Some(regs) = &fault.registers {
            log_dump!(self.log, "{}", regs);
        }
        EngineError::Fault(Box::new(fault))
    }

    fn notify_observer(&mut self) -> Result<(), EngineError> {
        let Some(mut observer) = self.ctl.observer.take() else {
            return Ok(());
        };
        let result = observer.round_completed(self);
        self.ctl.observer = Some(observer);
        result
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(err) = self.ctl.process.kill() {
            log_fail!(self.log, "kill failed: {}", err);
        }
        self.ctl.breakpoints.disarm_all();
        let exit_marker = self.ctl.exit_marker;
        self.ctl.remove_handler(exit_marker);
        self.ctl.scheduler_lock = self.lock_snapshot;
        self.ctl.last_schedule = self.schedule.clone();
        if self.state == SessionState::Completed {
            log_success!(self.log, "round {} completed, {} switches", self.round, self.schedule.len().saturating_sub(1));
        }
    }

    pub(crate) fn complete(&mut self) {
        self.state = SessionState::Completed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn live_count(&self) -> usize {
        self.threads.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_thread(&self) -> Option<&Thread> {
        self.current.map(|i| &self.threads[i])
    }

    pub fn current_thread_mut(&mut self) -> Option<&mut Thread> {
        match self.current {
            Some(i) => Some(&mut self.threads[i]),
            None => None,
        }
    }

    /// Remove a thread, keeping the order of the others. The session has no
    /// current thread afterwards until the next scheduling decision.
    pub fn remove_thread(&mut self, index: usize) -> Thread {
        self.current = None;
        self.threads.remove(index)
    }

    /// Thread chosen at every switch so far.
    pub fn schedule(&self) -> &[ThreadId] {
        &self.schedule
    }

    pub fn process(&self) -> &dyn ProcessControl {
        &*self.ctl.process
    }

    /// Call argument `n` of the current thread.
    pub fn argument(&self, n: usize) -> Result<u64, EngineError> {
        let thread = self.current_thread().ok_or(EngineError::NoCurrentThread)?;
        Ok(thread.argument(n, &*self.ctl.process)?)
    }

    pub fn set_return_value(&mut self, value: u64) -> Result<(), EngineError> {
        let thread = self.current_thread_mut().ok_or(EngineError::NoCurrentThread)?;
        thread.set_return_value(value);
        Ok(())
    }

    /// Skip the body of the function the current thread is entering.
    pub fn return_from_call(&mut self) -> Result<(), EngineError> {
        let stub = self.ctl.return_stub;
        let thread = self.current_thread_mut().ok_or(EngineError::NoCurrentThread)?;
        thread.set_pc(stub);
        Ok(())
    }

    pub fn lock_scheduler(&mut self) -> u32 {
        self.ctl.lock_scheduler()
    }

    pub fn unlock_scheduler(&mut self, level: u32) {
        self.ctl.unlock_scheduler(level);
    }

    pub fn semaphore(&self, key: u64) -> Option<&Semaphore> {
        self.ctl.semaphores.get(&key)
    }

    pub fn set_semaphore(&mut self, key: u64, semaphore: Semaphore) {
        self.ctl.semaphores.insert(key, semaphore);
    }

    pub fn remove_semaphore(&mut self, key: u64) -> Option<Semaphore> {
        self.ctl.semaphores.remove(&key)
    }

    /// Run `f` on the semaphore for `key`, creating it with `create` first if
    /// needed. The semaphore is lent out of the table for the duration so `f`
    /// can also drive the session.
    pub fn with_semaphore<R>(
        &mut self,
        key: u64,
        create: impl FnOnce() -> Semaphore,
        f: impl FnOnce(&mut Semaphore, &mut Session<'c>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut semaphore = self.ctl.semaphores.remove(&key).unwrap_or_else(create);
        let result = f(&mut semaphore, self);
        self.ctl.semaphores.insert(key, semaphore);
        result
    }

    /// Record a misuse the child can survive; the round goes on.
    pub fn report_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log_fail!(self.log, "round {}: {}", self.round, message);
        self.ctl.report_error(message);
    }

    pub fn symbolize(&self, addr: u64) -> String {
        self.ctl.functions.symbols().symbolize(addr)
    }
}

impl Scheduling for Session<'_> {
    fn current_thread_id(&self) -> Option<ThreadId> {
        self.current_thread().map(Thread::id)
    }

    fn set_blocked(&mut self, thread: ThreadId, blocked: bool) {
        if let Some(t) = self.threads.iter_mut().find(|t| t.id() == thread) {
            if blocked {
                t.block();
            } else {
                t.unblock();
            }
        }
    }

    fn force_reschedule(&mut self) -> Result<(), EngineError> {
        Session::force_reschedule(self)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}
