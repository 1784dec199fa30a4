//! Synthetic threads.
//!
//! A thread is a function, its argument, a private stack and a saved register
//! file. Only one thread's registers are ever loaded into the child; the rest
//! wait in their snapshots.

use std::fmt;

use racetrap_common::align_down;
use racetrap_target::{ProcessControl, Registers, TargetError};

/// Index of a thread in the order it was registered. Stable across rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Signature of a function run as a thread.
pub type ThreadFn = extern "C" fn(usize) -> i32;

pub struct Thread {
    id: ThreadId,
    entry: u64,
    argument: u64,
    /// Private stack. The child inherits it at the same address.
    stack: Box<[u8]>,
    regs: Registers,
    blocked: bool,
    /// Set until the thread first runs; its entry breakpoint has to be
    /// reported without executing anything.
    fresh: bool,
}

impl Thread {
    /// Create a thread whose first instruction is `entry` and whose function
    /// returns into `exit_marker`.
    pub fn new(id: ThreadId, entry: u64, argument: u64, stack_size: usize, exit_marker: u64) -> Self {
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        let base = stack.as_ptr() as u64;
        // At function entry the return address sits at a stack pointer that is
        // 8 bytes off 16-byte alignment, as if `call` had just pushed it.
        let sp = align_down(base + stack_size as u64, 16) - 8;
        let slot = (sp - base) as usize;
        stack[slot..slot + 8].copy_from_slice(&exit_marker.to_le_bytes());

        let regs = Registers { rip: entry, rsp: sp, rdi: argument, ..Default::default() };
        Self { id, entry, argument, stack, regs, blocked: false, fresh: true }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// The argument the thread was registered with.
    pub fn initial_argument(&self) -> u64 {
        self.argument
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn set_registers(&mut self, regs: Registers) {
        self.regs = regs;
    }

    /// Copy segment and TLS state from the child's own registers.
    pub fn adopt_process_state(&mut self, host: &Registers) {
        self.regs.adopt_process_state(host);
    }

    pub fn pc(&self) -> u64 {
        self.regs.pc()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.regs.set_pc(pc);
    }

    pub fn return_value(&self) -> u64 {
        self.regs.return_value()
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.regs.set_return_value(value);
    }

    /// Call argument `n` of the function the thread is stopped at the entry of.
    pub fn argument(&self, n: usize, process: &dyn ProcessControl) -> Result<u64, TargetError> {
        match self.regs.call_argument(n) {
            Some(value) => Ok(value),
            None => {
                let word = process.arch().word_size;
                let stacked = (n - process.arch().register_arguments()) as u64 + 1;
                process.read_word(self.regs.sp() + stacked * word)
            }
        }
    }

    pub fn block(&mut self) {
        self.blocked = true;
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub(crate) fn take_fresh(&mut self) -> bool {
        std::mem::replace(&mut self.fresh, false)
    }

    /// Address range of the private stack.
    pub fn stack_range(&self) -> (u64, u64) {
        let base = self.stack.as_ptr() as u64;
        (base, base + self.stack.len() as u64)
    }

    fn on_stack(&self, addr: u64, len: u64) -> bool {
        let (lo, hi) = self.stack_range();
        addr >= lo && addr + len <= hi
    }

    /// Return addresses found by walking the frame-pointer chain, innermost
    /// first. Frame 0 is the pc. The walk stops at the edge of the thread's
    /// stack, at a null return address, or when the chain stops growing.
    pub fn backtrace(&self, process: &dyn ProcessControl, max_frames: usize) -> Vec<u64> {
        let mut frames = vec![self.regs.pc()];
        let mut fp = self.regs.fp();
        while frames.len() < max_frames && self.on_stack(fp, 16) {
            let (Ok(saved_fp), Ok(ret)) = (process.read_word(fp), process.read_word(fp + 8)) else {
                break;
            };
            if ret == 0 {
                break;
            }
            frames.push(ret);
            if saved_fp <= fp {
                break;
            }
            fp = saved_fp;
        }
        frames
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("argument", &self.argument)
            .field("pc", &format_args!("{:#x}", self.regs.pc()))
            .field("blocked", &self.blocked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetrap_target::ScriptedProcess;

    const STACK: usize = 64 * 1024;

    #[test]
    fn test_initial_context() {
        let thread = Thread::new(ThreadId(2), 0x401000, 7, STACK, 0xdead_0000);
        let regs = thread.registers();
        assert_eq!(regs.rip, 0x401000);
        assert_eq!(regs.rdi, 7);
        assert_eq!(regs.rbp, 0);
        assert_eq!((regs.rsp + 8) % 16, 0);

        let (lo, hi) = thread.stack_range();
        assert!(regs.rsp >= lo && regs.rsp + 8 <= hi);
        let slot = (regs.rsp - lo) as usize;
        assert_eq!(&thread.stack[slot..slot + 8], &0xdead_0000u64.to_le_bytes());
    }

    #[test]
    fn test_block_and_unblock() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 0, STACK, 0);
        assert!(!thread.is_blocked());
        thread.block();
        assert!(thread.is_blocked());
        thread.unblock();
        assert!(!thread.is_blocked());
    }

    #[test]
    fn test_fresh_flag_is_taken_once() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 0, STACK, 0);
        assert!(thread.take_fresh());
        assert!(!thread.take_fresh());
    }

    #[test]
    fn test_register_and_stack_arguments() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 11, STACK, 0);
        let mut regs = *thread.registers();
        regs.rsi = 22;
        regs.r9 = 66;
        regs.rsp = 0x7000;
        thread.set_registers(regs);

        let mut stack = vec![0u8; 32];
        stack[8..16].copy_from_slice(&77u64.to_le_bytes());
        stack[16..24].copy_from_slice(&88u64.to_le_bytes());
        let process = ScriptedProcess::new().with_memory(0x7000, &stack);

        assert_eq!(thread.argument(0, &process).unwrap(), 11);
        assert_eq!(thread.argument(1, &process).unwrap(), 22);
        assert_eq!(thread.argument(5, &process).unwrap(), 66);
        assert_eq!(thread.argument(6, &process).unwrap(), 77);
        assert_eq!(thread.argument(7, &process).unwrap(), 88);
    }

    #[test]
    fn test_return_value_and_pc() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 0, STACK, 0);
        thread.set_return_value(16);
        thread.set_pc(0x2000);
        assert_eq!(thread.return_value(), 16);
        assert_eq!(thread.pc(), 0x2000);
    }

    #[test]
    fn test_backtrace_walks_frame_chain() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 0, STACK, 0);
        let (lo, _) = thread.stack_range();
        let outer = lo + 0x200;
        let inner = lo + 0x100;

        let mut image = vec![0u8; 0x300];
        // inner frame: saved fp -> outer, return into caller
        image[0x100..0x108].copy_from_slice(&outer.to_le_bytes());
        image[0x108..0x110].copy_from_slice(&0x4010u64.to_le_bytes());
        // outer frame: end of chain
        image[0x200..0x208].copy_from_slice(&0u64.to_le_bytes());
        image[0x208..0x210].copy_from_slice(&0x5020u64.to_le_bytes());
        let process = ScriptedProcess::new().with_memory(lo, &image);

        let mut regs = *thread.registers();
        regs.rip = 0x3000;
        regs.rbp = inner;
        thread.set_registers(regs);

        assert_eq!(thread.backtrace(&process, 16), vec![0x3000, 0x4010, 0x5020]);
        assert_eq!(thread.backtrace(&process, 2), vec![0x3000, 0x4010]);
    }

    #[test]
    fn test_backtrace_stops_off_stack() {
        let mut thread = Thread::new(ThreadId(0), 0x1000, 0, STACK, 0);
        let mut regs = *thread.registers();
        regs.rip = 0x3000;
        regs.rbp = 0x10;
        thread.set_registers(regs);
        let process = ScriptedProcess::new();
        assert_eq!(thread.backtrace(&process, 16), vec![0x3000]);
    }
}
