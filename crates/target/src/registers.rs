//! x86_64 register file.
//!
//! The layout matches the kernel's `user_regs_struct`, so a `Registers` value
//! can be handed straight to `PTRACE_GETREGS` / `PTRACE_SETREGS`.

use std::fmt;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Registers {
    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    pub fn sp(&self) -> u64 {
        self.rsp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }

    pub fn fp(&self) -> u64 {
        self.rbp
    }

    pub fn return_value(&self) -> u64 {
        self.rax
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    /// Integer call argument `n` when it is passed in a register.
    pub fn call_argument(&self, n: usize) -> Option<u64> {
        match n {
            0 => Some(self.rdi),
            1 => Some(self.rsi),
            2 => Some(self.rdx),
            3 => Some(self.rcx),
            4 => Some(self.r8),
            5 => Some(self.r9),
            _ => None,
        }
    }

    /// Copy the state every thread shares with the process it runs in:
    /// segment selectors, TLS bases and flags.
    pub fn adopt_process_state(&mut self, host: &Registers) {
        self.cs = host.cs;
        self.ss = host.ss;
        self.ds = host.ds;
        self.es = host.es;
        self.fs = host.fs;
        self.gs = host.gs;
        self.fs_base = host.fs_base;
        self.gs_base = host.gs_base;
        self.eflags = host.eflags;
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            [("rax", self.rax), ("rbx", self.rbx), ("rcx", self.rcx)],
            [("rdx", self.rdx), ("rsi", self.rsi), ("rdi", self.rdi)],
            [("rbp", self.rbp), ("rsp", self.rsp), ("rip", self.rip)],
            [("r8", self.r8), ("r9", self.r9), ("r10", self.r10)],
            [("r11", self.r11), ("r12", self.r12), ("r13", self.r13)],
            [("r14", self.r14), ("r15", self.r15), ("eflags", self.eflags)],
        ];
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let cells: Vec<String> = row.iter().map(|(name, v)| format!("{:>6} {:#018x}", name, v)).collect();
            write!(f, "{}", cells.join("  "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<Registers>(), 27 * 8);
    }

    #[test]
    fn test_call_arguments() {
        let regs = Registers { rdi: 1, rsi: 2, rdx: 3, rcx: 4, r8: 5, r9: 6, ..Default::default() };
        let args: Vec<_> = (0..6).filter_map(|n| regs.call_argument(n)).collect();
        assert_eq!(args, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.call_argument(6), None);
    }

    #[test]
    fn test_adopt_process_state_keeps_gprs() {
        let host = Registers { cs: 0x33, ss: 0x2b, fs_base: 0x7f00_0000_1000, eflags: 0x246, rax: 99, ..Default::default() };
        let mut regs = Registers { rip: 0x401000, rdi: 7, ..Default::default() };
        regs.adopt_process_state(&host);
        assert_eq!(regs.cs, 0x33);
        assert_eq!(regs.fs_base, 0x7f00_0000_1000);
        assert_eq!(regs.eflags, 0x246);
        assert_eq!(regs.rip, 0x401000);
        assert_eq!(regs.rdi, 7);
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn test_display_lists_pc() {
        let regs = Registers { rip: 0x401000, ..Default::default() };
        let text = regs.to_string();
        assert!(text.contains("rip 0x0000000000401000"));
        assert_eq!(text.lines().count(), 6);
    }
}
