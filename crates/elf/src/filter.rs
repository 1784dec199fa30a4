//! Deciding which main-executable functions belong to the program under test.
//!
//! Rust symbols carry their crate as the first path component of the mangled
//! name (`_ZN3std2io5stdio6_print17h...E`), so runtime and engine code is
//! recognised by crate. Trait impls (`_ZN.._$LT$std..vec..Vec$LT$T$GT$$u20$as$u20$..`)
//! are attributed to the crate of their self type.

use crate::symbols::FunctionKind;

const LIBRARY_CRATES: &[&str] = &[
    "std",
    "core",
    "alloc",
    "test",
    "panic_unwind",
    "panic_abort",
    "hashbrown",
    "libc",
    "iced_x86",
    "rand",
    "rand_core",
    "rand_pcg",
    "rand_chacha",
    "ppv_lite86",
    "getrandom",
    "thiserror",
    "datatest_stable",
    "racetrap",
    "racetrap_common",
    "racetrap_target",
    "racetrap_elf",
    "racetrap_disasm",
];

/// C runtime and startup code.
const LIBRARY_PREFIXES: &[&str] = &["_", ".", "rust_"];
const LIBRARY_NAMES: &[&str] = &["main", "frame_dummy", "register_tm_clones", "deregister_tm_clones"];

#[derive(Debug, Clone)]
pub struct SymbolFilter {
    crates: Vec<String>,
    prefixes: Vec<String>,
}

impl Default for SymbolFilter {
    fn default() -> Self {
        Self {
            crates: LIBRARY_CRATES.iter().map(|s| s.to_string()).collect(),
            prefixes: LIBRARY_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SymbolFilter {
    /// Treat `name` as library code too. A bare identifier names a crate;
    /// anything else is a raw symbol prefix.
    pub fn exclude(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with('_') {
            self.crates.push(name.to_string());
        }
        self.prefixes.push(name.to_string());
    }

    pub fn classify(&self, symbol: &str) -> FunctionKind {
        let library = match rust_crate(symbol) {
            Some(krate) => self.crates.iter().any(|c| c == krate) || self.has_excluded_prefix(symbol, true),
            None if symbol.starts_with("_R") => self.v0_mentions_library(symbol),
            None => LIBRARY_NAMES.contains(&symbol) || self.has_excluded_prefix(symbol, false),
        };
        if library {
            FunctionKind::Library
        } else {
            FunctionKind::Normal
        }
    }

    fn has_excluded_prefix(&self, symbol: &str, mangled: bool) -> bool {
        self.prefixes
            .iter()
            // The built-in "_" prefix would swallow every mangled name.
            .filter(|p| !mangled || !LIBRARY_PREFIXES.contains(&p.as_str()))
            .any(|p| symbol.starts_with(p.as_str()))
    }

    fn v0_mentions_library(&self, symbol: &str) -> bool {
        self.crates.iter().any(|c| symbol.contains(&format!("{}{}", c.len(), c)))
    }
}

/// First path component of a legacy-mangled Rust symbol.
fn rust_crate(symbol: &str) -> Option<&str> {
    let rest = symbol.strip_prefix("_ZN")?;
    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    let len: usize = rest[..digits].parse().ok()?;
    let component = rest.get(digits..digits + len)?;
    match component.strip_prefix("_$LT$") {
        Some(impl_path) => impl_path.split("..").next(),
        None => Some(component),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_crate() {
        assert_eq!(rust_crate("_ZN3std2io5stdio6_print17h0123456789abcdefE"), Some("std"));
        assert_eq!(rust_crate("_ZN8selftest6worker17h0123456789abcdefE"), Some("selftest"));
        assert_eq!(
            rust_crate("_ZN64_$LT$alloc..vec..Vec$LT$T$GT$$u20$as$u20$core..ops..drop..Drop$GT$4drop17h01E"),
            Some("alloc")
        );
        assert_eq!(rust_crate("worker"), None);
        assert_eq!(rust_crate("_ZN99short"), None);
    }

    #[test]
    fn test_classify_rust_symbols() {
        let filter = SymbolFilter::default();
        assert_eq!(filter.classify("_ZN8selftest6worker17h0123456789abcdefE"), FunctionKind::Normal);
        assert_eq!(filter.classify("_ZN4core3fmt5write17h0123456789abcdefE"), FunctionKind::Library);
        assert_eq!(filter.classify("_ZN8racetrap7session7Session3run17h01E"), FunctionKind::Library);
        assert_eq!(filter.classify("_ZN12racetrap_cli9scenarios6worker17h01E"), FunctionKind::Normal);
    }

    #[test]
    fn test_classify_c_symbols() {
        let filter = SymbolFilter::default();
        assert_eq!(filter.classify("increment"), FunctionKind::Normal);
        assert_eq!(filter.classify("_start"), FunctionKind::Library);
        assert_eq!(filter.classify("__libc_csu_init"), FunctionKind::Library);
        assert_eq!(filter.classify("main"), FunctionKind::Library);
        assert_eq!(filter.classify("maintain_counter"), FunctionKind::Normal);
        assert_eq!(filter.classify("rust_begin_unwind"), FunctionKind::Library);
    }

    #[test]
    fn test_classify_v0_symbols() {
        let filter = SymbolFilter::default();
        assert_eq!(filter.classify("_RNvNtCs1234_3std2io5_print"), FunctionKind::Library);
        assert_eq!(filter.classify("_RNvCs1234_8selftest6worker"), FunctionKind::Normal);
    }

    #[test]
    fn test_exclude_extra() {
        let mut filter = SymbolFilter::default();
        filter.exclude("selftest");
        filter.exclude("helper_");
        filter.exclude("  ");
        assert_eq!(filter.classify("_ZN8selftest6worker17h01E"), FunctionKind::Library);
        assert_eq!(filter.classify("helper_add"), FunctionKind::Library);
        assert_eq!(filter.classify("worker"), FunctionKind::Normal);
    }
}
