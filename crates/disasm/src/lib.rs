//! Instruction scanning.
//!
//! The engine only needs to know where a function touches memory: every
//! explicit memory operand becomes a scheduling point. Calls and branches are
//! reported too so listeners can build a picture of control flow.

use iced_x86::{Decoder, DecoderOptions, FlowControl, InstructionInfo, InstructionInfoFactory, Mnemonic, OpAccess, OpKind};
use racetrap_common::debug::{create_logger, Logger};
use racetrap_common::log_detail;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid instruction at {addr:#x}")]
    Invalid { addr: u64 },
}

/// Receives classified instructions. Offsets are relative to the start of
/// the scanned buffer.
pub trait InstructionListener {
    fn on_memory_reference(&mut self, _offset: u64, _is_load: bool) {}
    fn on_call(&mut self, _offset: u64, _target: Option<u64>) {}
    fn on_branch(&mut self, _offset: u64, _target: Option<u64>) {}
}

pub trait InstructionScanner {
    /// Decode `code`, which lives at `addr`, and report to `listener`.
    fn scan(&self, code: &[u8], addr: u64, listener: &mut dyn InstructionListener) -> Result<(), ScanError>;

    /// Offsets of all memory-referencing instructions in `code`.
    fn memory_references(&self, code: &[u8], addr: u64) -> Result<Vec<u64>, ScanError> {
        let mut collector = MemoryReferences::default();
        self.scan(code, addr, &mut collector)?;
        Ok(collector.offsets)
    }
}

/// Collects memory-reference offsets.
#[derive(Debug, Default)]
pub struct MemoryReferences {
    pub offsets: Vec<u64>,
}

impl InstructionListener for MemoryReferences {
    fn on_memory_reference(&mut self, offset: u64, _is_load: bool) {
        self.offsets.push(offset);
    }
}

/// x86_64 scanner.
pub struct X86Scanner {
    log: Logger,
}

impl X86Scanner {
    pub fn new() -> Self {
        Self { log: create_logger("disasm") }
    }
}

impl Default for X86Scanner {
    fn default() -> Self {
        Self::new()
    }
}

fn operand_access(info: &InstructionInfo, operand: u32) -> OpAccess {
    match operand {
        0 => info.op0_access(),
        1 => info.op1_access(),
        2 => info.op2_access(),
        3 => info.op3_access(),
        _ => info.op4_access(),
    }
}

fn branch_target(kind: OpKind, instr: &iced_x86::Instruction) -> Option<u64> {
    match kind {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Some(instr.near_branch_target()),
        _ => None,
    }
}

impl InstructionScanner for X86Scanner {
    fn scan(&self, code: &[u8], addr: u64, listener: &mut dyn InstructionListener) -> Result<(), ScanError> {
        let mut decoder = Decoder::with_ip(64, code, addr, DecoderOptions::NONE);
        let mut info_factory = InstructionInfoFactory::new();
        while decoder.can_decode() {
            let instr = decoder.decode();
            if instr.is_invalid() {
                // Padding after the last instruction is common; garbage inside
                // the body is not.
                if code[(instr.ip() - addr) as usize..].iter().all(|&b| b == 0 || b == 0xcc) {
                    break;
                }
                return Err(ScanError::Invalid { addr: instr.ip() });
            }
            let offset = instr.ip() - addr;

            match instr.flow_control() {
                FlowControl::Call | FlowControl::IndirectCall => {
                    listener.on_call(offset, branch_target(instr.op0_kind(), &instr));
                    continue;
                }
                FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::IndirectBranch => {
                    listener.on_branch(offset, branch_target(instr.op0_kind(), &instr));
                    continue;
                }
                _ => {}
            }

            if matches!(instr.mnemonic(), Mnemonic::Lea | Mnemonic::Nop) {
                continue;
            }
            let memory_operand = (0..instr.op_count()).find(|&i| instr.op_kind(i) == OpKind::Memory);
            if let Some(i) = memory_operand {
                let access = operand_access(info_factory.info(&instr), i);
                let is_load = matches!(access, OpAccess::Read | OpAccess::CondRead);
                log_detail!(self.log, "memory reference at {:#x}: {}", instr.ip(), instr);
                listener.on_memory_reference(offset, is_load);
            }
        }
        Ok(())
    }
}
