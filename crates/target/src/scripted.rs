//! In-memory process control that replays scripted stops.
//!
//! Each call to [`fork_and_attach`](ProcessControl::fork_and_attach) starts the
//! next scripted round. [`continue_execution`](ProcessControl::continue_execution)
//! walks that round's stops in order; a trap at an address that is not armed
//! is skipped, the way a real child would run straight through it.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use crate::arch::{ArchInfo, X86_64};
use crate::error::TargetError;
use crate::event::{BreakpointId, PtraceEvent};
use crate::process::ProcessControl;
use crate::registers::Registers;

/// One scripted stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Breakpoint trap at an address
    Trap(u64),
    /// Fatal signal at an address
    Crash(u64, i32),
    Syscall(u64),
    /// Unclassified stop signal
    Unknown(i32),
    Exit(i32),
}

/// Shared view of the operations a [`ScriptedProcess`] performed. Stays
/// readable after the process itself has been handed to an engine.
pub type CallLog = Rc<RefCell<Vec<Call>>>;

/// An operation the engine performed, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Fork,
    SetBreakpoint(u64),
    ClearBreakpoint(u64),
    StepOver(u64),
    Continue,
    LoadRegisters { pc: u64 },
    Kill,
}

pub struct ScriptedProcess {
    rounds: VecDeque<Vec<Stop>>,
    current: VecDeque<Stop>,
    fail_fork: bool,
    initial: Registers,
    registers: Registers,
    memory: BTreeMap<u64, Vec<u8>>,
    armed: HashMap<u64, BreakpointId>,
    next_id: u32,
    running: bool,
    pid: i32,
    calls: CallLog,
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self {
            rounds: VecDeque::new(),
            current: VecDeque::new(),
            fail_fork: false,
            initial: Registers { cs: 0x33, ss: 0x2b, eflags: 0x246, fs_base: 0x7f00_dead_0000, ..Default::default() },
            registers: Registers::default(),
            memory: BTreeMap::new(),
            armed: HashMap::new(),
            next_id: 1,
            running: false,
            pid: 4000,
            calls: CallLog::default(),
        }
    }

    /// Append a round of stops.
    pub fn round(mut self, stops: impl IntoIterator<Item = Stop>) -> Self {
        self.rounds.push_back(stops.into_iter().collect());
        self
    }

    /// Make every fork fail.
    pub fn failing_fork(mut self) -> Self {
        self.fail_fork = true;
        self
    }

    /// Map `bytes` at `addr`.
    pub fn with_memory(mut self, addr: u64, bytes: &[u8]) -> Self {
        self.memory.insert(addr, bytes.to_vec());
        self
    }

    /// Registers every fork starts the child with.
    pub fn initial_registers(&self) -> Registers {
        self.initial
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn call_log(&self) -> CallLog {
        Rc::clone(&self.calls)
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    pub fn armed_addresses(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.armed.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn is_armed(&self, addr: u64) -> bool {
        self.armed.contains_key(&addr)
    }

    fn require_running(&self) -> Result<(), TargetError> {
        if self.running {
            Ok(())
        } else {
            Err(TargetError::NotRunning)
        }
    }
}

impl Default for ScriptedProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for ScriptedProcess {
    fn fork_and_attach(&mut self) -> Result<i32, TargetError> {
        self.record(Call::Fork);
        if self.fail_fork {
            return Err(TargetError::Fork(io::Error::new(io::ErrorKind::Other, "scripted fork failure")));
        }
        let Some(stops) = self.rounds.pop_front() else {
            return Err(TargetError::Script("no scripted rounds left".to_string()));
        };
        self.current = stops.into();
        self.armed.clear();
        self.registers = self.initial;
        self.running = true;
        self.pid += 1;
        Ok(self.pid)
    }

    fn set_breakpoint(&mut self, addr: u64) -> Result<BreakpointId, TargetError> {
        self.require_running()?;
        self.record(Call::SetBreakpoint(addr));
        if let Some(&id) = self.armed.get(&addr) {
            return Ok(id);
        }
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        self.armed.insert(addr, id);
        Ok(id)
    }

    fn clear_breakpoint(&mut self, id: BreakpointId) -> Result<bool, TargetError> {
        self.require_running()?;
        let addr = self.armed.iter().find(|(_, v)| **v == id).map(|(a, _)| *a);
        match addr {
            Some(addr) => {
                self.armed.remove(&addr);
                self.record(Call::ClearBreakpoint(addr));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn step_over_breakpoint(&mut self, addr: u64) -> Result<PtraceEvent, TargetError> {
        self.require_running()?;
        self.record(Call::StepOver(addr));
        self.registers.rip = addr + 1;
        Ok(PtraceEvent::step(self.registers.rip))
    }

    fn continue_execution(&mut self) -> Result<PtraceEvent, TargetError> {
        self.require_running()?;
        self.record(Call::Continue);
        while let Some(stop) = self.current.pop_front() {
            let event = match stop {
                Stop::Trap(addr) => match self.armed.get(&addr) {
                    Some(&id) => {
                        self.registers.rip = addr + X86_64.breakpoint_pc_adjust;
                        PtraceEvent::breakpoint(addr, id)
                    }
                    None => continue,
                },
                Stop::Crash(addr, sig) => {
                    self.registers.rip = addr;
                    PtraceEvent::crash(addr, sig)
                }
                Stop::Syscall(addr) => PtraceEvent::syscall(addr),
                Stop::Unknown(sig) => PtraceEvent::error(self.registers.rip, sig),
                Stop::Exit(status) => {
                    self.running = false;
                    PtraceEvent::exit(status)
                }
            };
            return Ok(event);
        }
        self.running = false;
        Ok(PtraceEvent::exit(0))
    }

    fn save_registers(&mut self) -> Result<Registers, TargetError> {
        self.require_running()?;
        Ok(self.registers)
    }

    fn load_registers(&mut self, regs: &Registers) -> Result<(), TargetError> {
        self.require_running()?;
        self.record(Call::LoadRegisters { pc: regs.rip });
        self.registers = *regs;
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        let (&base, bytes) = self.memory.range(..=addr).next_back().ok_or(TargetError::Memory { addr })?;
        let start = (addr - base) as usize;
        if start + len > bytes.len() {
            return Err(TargetError::Memory { addr });
        }
        Ok(bytes[start..start + len].to_vec())
    }

    fn kill(&mut self) -> Result<(), TargetError> {
        if self.running {
            self.record(Call::Kill);
        }
        self.running = false;
        self.armed.clear();
        self.current.clear();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn arch(&self) -> &'static ArchInfo {
        &X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_unarmed_traps_are_skipped() {
        let mut process = ScriptedProcess::new().round([Stop::Trap(0x10), Stop::Trap(0x20)]);
        process.fork_and_attach().unwrap();
        let id = process.set_breakpoint(0x20).unwrap();
        let ev = process.continue_execution().unwrap();
        assert_eq!(ev, PtraceEvent::breakpoint(0x20, id));
        assert_eq!(process.save_registers().unwrap().rip, 0x21);
        assert_eq!(process.continue_execution().unwrap().kind, EventKind::Exit);
        assert!(!process.is_running());
    }

    #[test]
    fn test_breakpoint_ids_are_stable() {
        let mut process = ScriptedProcess::new().round([]);
        process.fork_and_attach().unwrap();
        let a = process.set_breakpoint(0x10).unwrap();
        assert_eq!(process.set_breakpoint(0x10).unwrap(), a);
        assert!(process.clear_breakpoint(a).unwrap());
        assert!(!process.clear_breakpoint(a).unwrap());
    }

    #[test]
    fn test_fork_without_rounds_fails() {
        let mut process = ScriptedProcess::new();
        assert!(matches!(process.fork_and_attach(), Err(TargetError::Script(_))));
        let mut failing = ScriptedProcess::new().round([]).failing_fork();
        assert!(matches!(failing.fork_and_attach(), Err(TargetError::Fork(_))));
    }

    #[test]
    fn test_read_memory_regions() {
        let process = ScriptedProcess::new().with_memory(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(process.read_memory(0x1002, 3).unwrap(), vec![3, 4, 5]);
        assert_eq!(process.read_word(0x1000).unwrap(), 0x0807060504030201);
        assert!(process.read_memory(0x1008, 4).is_err());
        assert!(process.read_memory(0x10, 1).is_err());
    }

    #[test]
    fn test_fork_resets_registers_and_breakpoints() {
        let mut process = ScriptedProcess::new().round([]).round([]);
        process.fork_and_attach().unwrap();
        process.set_breakpoint(0x10).unwrap();
        process.load_registers(&Registers { rip: 0x99, ..Default::default() }).unwrap();
        process.kill().unwrap();
        process.fork_and_attach().unwrap();
        assert!(process.armed_addresses().is_empty());
        let log = process.call_log();
        assert_eq!(log.borrow().iter().filter(|c| **c == Call::Fork).count(), 2);
        assert!(process.calls().contains(&Call::Kill));
        assert_eq!(process.save_registers().unwrap().cs, 0x33);
        assert_eq!(process.save_registers().unwrap().rip, 0);
    }
}
