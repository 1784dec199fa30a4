use crate::arch::ArchInfo;
use crate::error::TargetError;
use crate::event::{BreakpointId, PtraceEvent};
use crate::registers::Registers;

/// Primitive debugging operations on the traced child.
///
/// All methods act on the child forked by the most recent
/// [`fork_and_attach`](Self::fork_and_attach). Memory and registers are only
/// touched while the child is stopped.
pub trait ProcessControl {
    /// Fork a traced copy of the current process and wait for its first stop.
    ///
    /// Returns the child's pid in the parent. In the child this never returns:
    /// the child parks itself and only runs code the tracer points it at.
    fn fork_and_attach(&mut self) -> Result<i32, TargetError>;

    /// Patch a breakpoint at `addr`. Arming an already armed address returns
    /// the existing id.
    fn set_breakpoint(&mut self, addr: u64) -> Result<BreakpointId, TargetError>;

    /// Restore the original instruction. Returns false if `id` was not armed.
    fn clear_breakpoint(&mut self, id: BreakpointId) -> Result<bool, TargetError>;

    /// Execute the original instruction under the breakpoint at `addr` (the
    /// current pc) and leave the breakpoint armed.
    fn step_over_breakpoint(&mut self, addr: u64) -> Result<PtraceEvent, TargetError>;

    /// Resume until the next stop.
    fn continue_execution(&mut self) -> Result<PtraceEvent, TargetError>;

    /// Read the child's registers.
    fn save_registers(&mut self) -> Result<Registers, TargetError>;

    /// Install `regs` as the child's registers.
    fn load_registers(&mut self, regs: &Registers) -> Result<(), TargetError>;

    /// Read child memory. Armed breakpoints are reported with their original
    /// bytes.
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError>;

    /// Kill and reap the child. Killing when nothing runs is a no-op.
    fn kill(&mut self) -> Result<(), TargetError>;

    fn is_running(&self) -> bool;

    fn arch(&self) -> &'static ArchInfo;

    /// Read one little-endian machine word.
    fn read_word(&self, addr: u64) -> Result<u64, TargetError> {
        let bytes = self.read_memory(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        Ok(u64::from_le_bytes(word))
    }
}
