//! Functions known to the engine and which of them have been explored.

use std::collections::HashSet;

use racetrap_elf::{Function, FunctionKind, SymbolTable};

#[derive(Debug, Default)]
pub struct FunctionTable {
    symbols: SymbolTable,
    explored: HashSet<u64>,
}

impl FunctionTable {
    pub fn new(symbols: SymbolTable) -> Self {
        Self { symbols, explored: HashSet::new() }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Entries of every function the engine may instrument, in address order.
    pub fn instrumentable_entries(&self) -> Vec<u64> {
        let mut entries: Vec<u64> = self
            .symbols
            .functions()
            .filter(|f| f.kind == FunctionKind::Normal && f.size > 0)
            .map(|f| f.entry)
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn instrumentable(&self, entry: u64) -> Option<&Function> {
        self.symbols.at(entry).filter(|f| f.kind == FunctionKind::Normal && f.size > 0)
    }

    /// Record `entry` as explored. Returns false if it already was.
    pub fn mark_explored(&mut self, entry: u64) -> bool {
        self.explored.insert(entry)
    }

    pub fn is_explored(&self, entry: u64) -> bool {
        self.explored.contains(&entry)
    }

    pub fn explored_count(&self) -> usize {
        self.explored.len()
    }
}
