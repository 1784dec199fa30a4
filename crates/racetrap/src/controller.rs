//! The engine context.
//!
//! A `Controller` owns everything that outlives a round: the registered
//! threads, the function and handler tables, the breakpoint table, the
//! selector and the stopping conditions. [`run`](Controller::run) builds one
//! [`Session`] per round until the budget is spent or a round fails.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use racetrap_common::debug::{create_logger, Logger};
use racetrap_common::{log, log_fail, log_success};
use racetrap_disasm::InstructionScanner;
use racetrap_elf::SymbolTable;
use racetrap_target::ProcessControl;

use crate::breakpoints::{BreakpointRole, BreakpointTable};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::functions::FunctionTable;
use crate::handler::FunctionHandler;
use crate::markers::{exit_marker_address, return_stub_address};
use crate::selector::ThreadSelector;
use crate::semaphore::Semaphore;
use crate::session::Session;
use crate::thread::{ThreadFn, ThreadId};

/// Most threads a controller accepts.
pub const MAX_THREADS: usize = 16;

pub(crate) struct PendingThread {
    pub entry: u64,
    pub argument: u64,
}

/// Called after every completed round while the child is still stopped, so
/// final shared state can be read out of it.
pub trait RoundObserver {
    fn round_completed(&mut self, session: &Session<'_>) -> Result<(), EngineError>;
}

impl<F> RoundObserver for F
where
    F: FnMut(&Session<'_>) -> Result<(), EngineError>,
{
    fn round_completed(&mut self, session: &Session<'_>) -> Result<(), EngineError> {
        self(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: u64,
    pub elapsed: Duration,
    pub selector: String,
}

pub struct Controller {
    pub(crate) config: EngineConfig,
    pub(crate) pending: Vec<PendingThread>,
    pub(crate) functions: FunctionTable,
    pub(crate) handlers: HashMap<u64, Rc<dyn FunctionHandler>>,
    pub(crate) breakpoints: BreakpointTable,
    /// Emulated synchronization objects, keyed by address. Cleared every round.
    pub(crate) semaphores: HashMap<u64, Semaphore>,
    pub(crate) selector: Box<dyn ThreadSelector>,
    pub(crate) observer: Option<Box<dyn RoundObserver>>,
    pub(crate) process: Box<dyn ProcessControl>,
    pub(crate) scanner: Box<dyn InstructionScanner>,
    pub(crate) scheduler_lock: u32,
    pub(crate) exit_marker: u64,
    pub(crate) return_stub: u64,
    pub(crate) last_schedule: Vec<ThreadId>,
    runs: u64,
    time_limit: Option<Duration>,
    error: Option<String>,
    log: Logger,
}

impl Controller {
    pub fn new(
        symbols: SymbolTable,
        process: Box<dyn ProcessControl>,
        scanner: Box<dyn InstructionScanner>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let functions = FunctionTable::new(symbols);
        let mut breakpoints = BreakpointTable::new();
        for entry in functions.instrumentable_entries() {
            breakpoints.insert(entry, BreakpointRole::FunctionEntry);
        }

        let log = create_logger("controller");
        log!(
            log,
            "{} functions, {} instrumentable",
            functions.symbols().len(),
            breakpoints.count_role(BreakpointRole::FunctionEntry)
        );

        let mut ctl = Self {
            selector: config.build_selector(),
            runs: 0,
            time_limit: None,
            pending: Vec::new(),
            functions,
            handlers: HashMap::new(),
            breakpoints,
            semaphores: HashMap::new(),
            observer: None,
            process,
            scanner,
            scheduler_lock: 0,
            exit_marker: exit_marker_address(),
            return_stub: return_stub_address(),
            last_schedule: Vec::new(),
            error: None,
            config,
            log,
        };
        ctl.set_runs(ctl.config.runs);
        ctl.set_time_limit(ctl.config.time_limit_ms);
        Ok(ctl)
    }

    /// Register `f(argument)` as a thread of every round.
    pub fn add_thread(&mut self, f: ThreadFn, argument: usize) -> Result<ThreadId, EngineError> {
        self.add_thread_at(f as usize as u64, argument as u64)
    }

    /// Register a thread by entry address.
    pub fn add_thread_at(&mut self, entry: u64, argument: u64) -> Result<ThreadId, EngineError> {
        if self.pending.len() >= MAX_THREADS {
            return Err(EngineError::TooManyThreads(MAX_THREADS));
        }
        let id = ThreadId(self.pending.len() as u32);
        self.pending.push(PendingThread { entry, argument });
        log!(self.log, "thread {} at {} ({})", id, self.functions.symbols().symbolize(entry), argument);
        Ok(id)
    }

    pub fn thread_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop after `runs` rounds. Takes priority over the time limit; 0 means
    /// no run limit.
    pub fn set_runs(&mut self, runs: u64) {
        self.runs = runs;
    }

    /// Stop starting new rounds after `ms` milliseconds. Only used when no
    /// run limit is set; 0 means no time limit.
    pub fn set_time_limit(&mut self, ms: u64) {
        self.time_limit = (ms > 0).then(|| Duration::from_millis(ms));
    }

    pub fn set_thread_selector(&mut self, selector: Box<dyn ThreadSelector>) {
        self.selector = selector;
    }

    pub fn set_round_observer(&mut self, observer: impl RoundObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Trap calls to the function at `addr`, and to every other function
    /// carrying the same name, into `handler`.
    pub fn register_function_handler(&mut self, addr: u64, handler: Rc<dyn FunctionHandler>) -> Result<(), EngineError> {
        let name = self.functions.symbols().at(addr).map(|f| f.name.clone()).ok_or(EngineError::Unresolved(addr))?;
        let entries: Vec<u64> = self.functions.symbols().by_name(&name).iter().map(|f| f.entry).collect();
        for &entry in &entries {
            self.install_handler(entry, Rc::clone(&handler), BreakpointRole::Handler);
        }
        log!(self.log, "{} handles {} ({} addresses)", handler.name(), name, entries.len());
        Ok(())
    }

    /// Remove the handler for `addr` and its aliases. Returns whether any
    /// handler was removed.
    pub fn unregister_function_handler(&mut self, addr: u64) -> bool {
        let entries: Vec<u64> = match self.functions.symbols().at(addr) {
            Some(function) => self.functions.symbols().by_name(&function.name).iter().map(|f| f.entry).collect(),
            None => vec![addr],
        };
        let mut removed = false;
        for entry in entries {
            removed |= self.remove_handler(entry);
        }
        removed
    }

    pub(crate) fn install_handler(&mut self, addr: u64, handler: Rc<dyn FunctionHandler>, role: BreakpointRole) {
        self.handlers.insert(addr, handler);
        self.breakpoints.insert(addr, role);
    }

    pub(crate) fn remove_handler(&mut self, addr: u64) -> bool {
        if self.handlers.remove(&addr).is_none() {
            return false;
        }
        for role in [BreakpointRole::Handler, BreakpointRole::ExitMarker] {
            self.breakpoints.release(addr, role);
        }
        // An explored entry keeps only the scheduling point it may also be.
        if self.functions.is_explored(addr) {
            self.breakpoints.release(addr, BreakpointRole::FunctionEntry);
        }
        true
    }

    pub fn has_handler(&self, addr: u64) -> bool {
        self.handlers.contains_key(&addr)
    }

    /// Enter a no-preemption region. Returns the previous depth, to be passed
    /// back to [`unlock_scheduler`](Self::unlock_scheduler).
    pub fn lock_scheduler(&mut self) -> u32 {
        let previous = self.scheduler_lock;
        self.scheduler_lock += 1;
        previous
    }

    pub fn unlock_scheduler(&mut self, level: u32) {
        self.scheduler_lock = level;
    }

    pub fn scheduler_lock_depth(&self) -> u32 {
        self.scheduler_lock
    }

    pub fn report_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Message of the last failure, cleared when [`run`](Self::run) starts.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        self.functions.symbols()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Address every thread returns to.
    pub fn exit_marker(&self) -> u64 {
        self.exit_marker
    }

    /// Thread chosen at every switch of the most recent round.
    pub fn last_schedule(&self) -> &[ThreadId] {
        &self.last_schedule
    }

    pub fn explored_count(&self) -> usize {
        self.functions.explored_count()
    }

    fn budget_exhausted(&self, rounds: u64, elapsed: Duration) -> bool {
        if self.runs > 0 {
            return rounds >= self.runs;
        }
        match self.time_limit {
            Some(limit) => elapsed >= limit,
            None => false,
        }
    }

    /// Run rounds until the run or time budget is spent. The first failing
    /// round ends the run; its error is also kept in [`error`](Self::error).
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        self.error = None;
        if self.pending.is_empty() {
            let err = EngineError::NoThreads;
            self.report_error(err.to_string());
            return Err(err);
        }

        let started = Instant::now();
        let mut rounds = 0;
        log!(self.log, "running {} threads with {}", self.pending.len(), self.selector.describe());

        while !self.budget_exhausted(rounds, started.elapsed()) {
            if let Err(err) = Session::new(self, rounds, started).run() {
                log_fail!(self.log, "round {} failed: {}", rounds, err);
                self.report_error(err.to_string());
                return Err(err);
            }
            rounds += 1;
        }

        let summary = RunSummary { rounds, elapsed: started.elapsed(), selector: self.selector.describe() };
        log_success!(self.log, "{} rounds in {:?}", summary.rounds, summary.elapsed);
        Ok(summary)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Controller {
    /// A controller for the running binary, configured from the environment,
    /// with pthread and POSIX semaphore calls intercepted.
    pub fn for_current_process() -> Result<Self, EngineError> {
        Self::for_current_process_with(EngineConfig::from_env()?)
    }

    pub fn for_current_process_with(config: EngineConfig) -> Result<Self, EngineError> {
        use crate::apis::pthreads::{install_sync_handlers, SyncEntryPoints};

        let symbols = racetrap_elf::load_process_symbols(&config.symbol_filter())?;
        let process = Box::new(racetrap_target::PtraceProcess::new());
        let scanner = Box::new(racetrap_disasm::X86Scanner::new());
        let mut ctl = Self::new(symbols, process, scanner, config)?;
        install_sync_handlers(&mut ctl, &SyncEntryPoints::libc())?;
        Ok(ctl)
    }
}
