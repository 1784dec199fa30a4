//! Process control through ptrace on Linux x86_64.
//!
//! The traced child is a fork of the calling process, so every address the
//! engine knows about (functions, stacks, statics) is valid in the child too.

use std::collections::HashMap;
use std::io;
use std::ptr;

use libc::c_void;
use racetrap_common::debug::{create_logger, Logger};
use racetrap_common::{log, log_detail, Addr};

use crate::arch::{ArchInfo, X86_64};
use crate::error::TargetError;
use crate::event::{BreakpointId, PtraceEvent};
use crate::process::ProcessControl;
use crate::registers::Registers;

const _: () = assert!(std::mem::size_of::<Registers>() == std::mem::size_of::<libc::user_regs_struct>());

const INT3: u8 = 0xcc;
const SYSCALL_TRAP: i32 = libc::SIGTRAP | 0x80;

struct Patch {
    id: BreakpointId,
    original: u8,
}

/// A forked, ptrace-attached copy of the current process.
pub struct PtraceProcess {
    pid: i32,
    running: bool,
    /// Patched addresses and the byte each patch replaced
    patches: HashMap<u64, Patch>,
    by_id: HashMap<BreakpointId, u64>,
    next_id: u32,
    log: Logger,
}

impl PtraceProcess {
    pub fn new() -> Self {
        Self {
            pid: 0,
            running: false,
            patches: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            log: create_logger("ptrace"),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn ptrace_error(request: &'static str) -> TargetError {
        TargetError::Ptrace { request, source: io::Error::last_os_error() }
    }

    fn wait_status(&self) -> Result<i32, TargetError> {
        let mut status: libc::c_int = 0;
        loop {
            let result = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if result >= 0 {
                return Ok(status);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TargetError::Wait(err));
            }
        }
    }

    /// Wait for the next stop and classify it.
    fn wait_event(&mut self, stepping: bool) -> Result<PtraceEvent, TargetError> {
        let status = self.wait_status()?;

        if libc::WIFEXITED(status) {
            self.forget_child();
            return Ok(PtraceEvent::exit(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            self.forget_child();
            return Ok(PtraceEvent::exit(128 + libc::WTERMSIG(status)));
        }
        if !libc::WIFSTOPPED(status) {
            return Ok(PtraceEvent::error(0, 0));
        }

        let sig = libc::WSTOPSIG(status);
        let pc = self.save_registers()?.pc();
        let trap_addr = pc.wrapping_sub(X86_64.breakpoint_pc_adjust);
        let patch = self.patches.get(&trap_addr).map(|patch| patch.id);
        let event = classify_stop(sig, pc, stepping, patch);
        log_detail!(self.log, "pid {}: {}", self.pid, event);
        Ok(event)
    }

    fn forget_child(&mut self) {
        self.running = false;
        self.patches.clear();
        self.by_id.clear();
    }

    fn peek(&self, addr: u64) -> Result<u64, TargetError> {
        let word = unsafe {
            *libc::__errno_location() = 0;
            libc::ptrace(libc::PTRACE_PEEKDATA, self.pid, addr as *mut c_void, ptr::null_mut::<c_void>())
        };
        if word == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(0) {
                return Err(TargetError::Memory { addr });
            }
        }
        Ok(word as u64)
    }

    fn poke(&self, addr: u64, word: u64) -> Result<(), TargetError> {
        let result = unsafe {
            libc::ptrace(libc::PTRACE_POKEDATA, self.pid, addr as *mut c_void, word as *mut c_void)
        };
        if result < 0 {
            return Err(Self::ptrace_error("POKEDATA"));
        }
        Ok(())
    }

    /// Replace the low byte of the word at `addr`.
    fn write_byte(&self, addr: u64, byte: u8) -> Result<u8, TargetError> {
        let word = self.peek(addr)?;
        let previous = (word & 0xff) as u8;
        self.poke(addr, (word & !0xff) | byte as u64)?;
        Ok(previous)
    }

    fn require_running(&self) -> Result<(), TargetError> {
        if self.running {
            Ok(())
        } else {
            Err(TargetError::NotRunning)
        }
    }
}

impl Default for PtraceProcess {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs in the forked child: ask to be traced and wait for the tracer.
fn park_child() -> ! {
    unsafe {
        libc::ptrace(libc::PTRACE_TRACEME, 0, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>());
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        libc::raise(libc::SIGSTOP);
        // Only reached if the tracer resumes the child without redirecting it.
        libc::_exit(0)
    }
}

impl ProcessControl for PtraceProcess {
    fn fork_and_attach(&mut self) -> Result<i32, TargetError> {
        if self.running {
            self.kill()?;
        }
        self.forget_child();

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(TargetError::Fork(io::Error::last_os_error()));
        }
        if pid == 0 {
            park_child();
        }

        self.pid = pid;
        self.running = true;

        let status = self.wait_status()?;
        if !libc::WIFSTOPPED(status) || libc::WSTOPSIG(status) != libc::SIGSTOP {
            self.kill()?;
            return Err(TargetError::Fork(io::Error::new(
                io::ErrorKind::Other,
                format!("child did not stop after attach (status {:#x})", status),
            )));
        }

        let options = (libc::PTRACE_O_EXITKILL | libc::PTRACE_O_TRACESYSGOOD) as libc::c_long;
        let result = unsafe {
            libc::ptrace(libc::PTRACE_SETOPTIONS, pid, ptr::null_mut::<c_void>(), options as *mut c_void)
        };
        if result < 0 {
            let err = Self::ptrace_error("SETOPTIONS");
            self.kill()?;
            return Err(err);
        }

        log!(self.log, "attached to child {}", pid);
        Ok(pid)
    }

    fn set_breakpoint(&mut self, addr: u64) -> Result<BreakpointId, TargetError> {
        self.require_running()?;
        if let Some(patch) = self.patches.get(&addr) {
            return Ok(patch.id);
        }
        let original = self.write_byte(addr, INT3)?;
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        self.patches.insert(addr, Patch { id, original });
        self.by_id.insert(id, addr);
        log_detail!(self.log, "breakpoint {} at {}", id.0, Addr(addr));
        Ok(id)
    }

    fn clear_breakpoint(&mut self, id: BreakpointId) -> Result<bool, TargetError> {
        self.require_running()?;
        let Some(addr) = self.by_id.remove(&id) else {
            return Ok(false);
        };
        if let Some(patch) = self.patches.remove(&addr) {
            self.write_byte(addr, patch.original)?;
        }
        Ok(true)
    }

    fn step_over_breakpoint(&mut self, addr: u64) -> Result<PtraceEvent, TargetError> {
        self.require_running()?;
        let original = self.patches.get(&addr).map(|p| p.original);
        if let Some(byte) = original {
            self.write_byte(addr, byte)?;
        }

        let result = unsafe {
            libc::ptrace(libc::PTRACE_SINGLESTEP, self.pid, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>())
        };
        if result < 0 {
            return Err(Self::ptrace_error("SINGLESTEP"));
        }
        let event = self.wait_event(true)?;

        if original.is_some() && self.running {
            self.write_byte(addr, INT3)?;
        }
        Ok(event)
    }

    fn continue_execution(&mut self) -> Result<PtraceEvent, TargetError> {
        self.require_running()?;
        let result = unsafe {
            libc::ptrace(libc::PTRACE_CONT, self.pid, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>())
        };
        if result < 0 {
            return Err(Self::ptrace_error("CONT"));
        }
        self.wait_event(false)
    }

    fn save_registers(&mut self) -> Result<Registers, TargetError> {
        self.require_running()?;
        let mut regs = Registers::default();
        let result = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                self.pid,
                ptr::null_mut::<c_void>(),
                &mut regs as *mut Registers as *mut c_void,
            )
        };
        if result < 0 {
            return Err(Self::ptrace_error("GETREGS"));
        }
        Ok(regs)
    }

    fn load_registers(&mut self, regs: &Registers) -> Result<(), TargetError> {
        self.require_running()?;
        let result = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                self.pid,
                ptr::null_mut::<c_void>(),
                regs as *const Registers as *mut c_void,
            )
        };
        if result < 0 {
            return Err(Self::ptrace_error("SETREGS"));
        }
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        self.require_running()?;
        let end = addr + len as u64;
        let mut data = Vec::with_capacity(len + 16);
        let mut word_addr = addr & !7;
        while word_addr < end {
            data.extend_from_slice(&self.peek(word_addr)?.to_le_bytes());
            word_addr += 8;
        }
        let skip = (addr & 7) as usize;
        let mut bytes: Vec<u8> = data[skip..skip + len].to_vec();

        for (&bp, patch) in &self.patches {
            if bp >= addr && bp < end {
                bytes[(bp - addr) as usize] = patch.original;
            }
        }
        Ok(bytes)
    }

    fn kill(&mut self) -> Result<(), TargetError> {
        if self.pid > 0 && self.running {
            unsafe { libc::kill(self.pid, libc::SIGKILL) };
            // Reap so the child does not linger as a zombie.
            let _ = self.wait_status();
            log!(self.log, "killed child {}", self.pid);
        }
        self.forget_child();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn arch(&self) -> &'static ArchInfo {
        &X86_64
    }
}

impl Drop for PtraceProcess {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Turn a stop signal into an event. `patch` is the breakpoint patched just
/// before `pc`, if any.
fn classify_stop(sig: i32, pc: u64, stepping: bool, patch: Option<BreakpointId>) -> PtraceEvent {
    match sig {
        SYSCALL_TRAP => PtraceEvent::syscall(pc),
        libc::SIGTRAP if stepping => PtraceEvent::step(pc),
        libc::SIGTRAP => match patch {
            Some(id) => PtraceEvent::breakpoint(pc.wrapping_sub(X86_64.breakpoint_pc_adjust), id),
            None => PtraceEvent::error(pc, sig),
        },
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGABRT | libc::SIGSYS => {
            PtraceEvent::crash(pc, sig)
        }
        _ => PtraceEvent::error(pc, sig),
    }
}
