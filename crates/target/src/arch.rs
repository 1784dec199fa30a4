//! Architecture description used when fabricating thread contexts.

/// Architecture-specific constants.
pub struct ArchInfo {
    /// Architecture name
    pub name: &'static str,
    /// Size of a machine word in bytes
    pub word_size: u64,
    /// Required stack alignment at a call instruction
    pub stack_alignment: u64,
    /// Breakpoint instruction bytes
    pub breakpoint: &'static [u8],
    /// Bytes the pc has advanced past a breakpoint when the trap is reported
    pub breakpoint_pc_adjust: u64,
    /// Names of the integer argument registers, in calling-convention order
    pub argument_regs: &'static [&'static str],
}

impl ArchInfo {
    /// Number of call arguments passed in registers.
    pub fn register_arguments(&self) -> usize {
        self.argument_regs.len()
    }
}

/// x86_64 System V.
pub static X86_64: ArchInfo = ArchInfo {
    name: "x86_64",
    word_size: 8,
    stack_alignment: 16,
    breakpoint: &[0xcc],
    breakpoint_pc_adjust: 1,
    argument_regs: &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
};
