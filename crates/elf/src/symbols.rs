//! Function symbol table for the running process.

use std::collections::HashMap;

/// How the engine may treat a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// Code of the program under test; instrumented lazily
    Normal,
    /// Runtime or engine code in the main executable; never instrumented
    Library,
    /// Exported by a shared object; only reachable through handlers
    Dynamic,
}

/// A resolved function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Runtime address of the first instruction
    pub entry: u64,
    pub size: u64,
    pub kind: FunctionKind,
}

impl Function {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.entry && addr < self.entry + self.size.max(1)
    }
}

/// Address range of a loaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRange {
    /// File name of the object, without its directory
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// Functions indexed by address and by name.
#[derive(Debug, Default)]
pub struct SymbolTable {
    functions: Vec<Function>,
    images: Vec<ImageRange>,
    by_entry: HashMap<u64, usize>,
    by_name: HashMap<String, Vec<usize>>,
    sorted: Vec<usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function. A second symbol at an already known entry address is
    /// recorded as a name alias only.
    pub fn insert(&mut self, function: Function) {
        if let Some(&existing) = self.by_entry.get(&function.entry) {
            let names = self.by_name.entry(function.name).or_default();
            if !names.contains(&existing) {
                names.push(existing);
            }
            return;
        }
        let index = self.functions.len();
        self.by_entry.insert(function.entry, index);
        self.by_name.entry(function.name.clone()).or_default().push(index);
        let pos = self.sorted.partition_point(|&i| self.functions[i].entry < function.entry);
        self.sorted.insert(pos, index);
        self.functions.push(function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    /// Function whose entry is exactly `addr`.
    pub fn at(&self, addr: u64) -> Option<&Function> {
        self.by_entry.get(&addr).map(|&i| &self.functions[i])
    }

    /// Every function carrying `name`, across all loaded images.
    pub fn by_name(&self, name: &str) -> Vec<&Function> {
        self.by_name
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.functions[i]).collect())
            .unwrap_or_default()
    }

    /// Function whose body contains `addr`.
    pub fn containing(&self, addr: u64) -> Option<&Function> {
        let pos = self.sorted.partition_point(|&i| self.functions[i].entry <= addr);
        let candidate = &self.functions[*self.sorted.get(pos.checked_sub(1)?)?];
        candidate.contains(addr).then_some(candidate)
    }

    pub fn add_image(&mut self, image: ImageRange) {
        self.images.push(image);
    }

    /// Loaded object whose mapped range contains `addr`.
    pub fn image_containing(&self, addr: u64) -> Option<&ImageRange> {
        self.images.iter().find(|img| addr >= img.start && addr < img.end)
    }

    /// Render `addr` as `name+0xoff` when it falls inside a known function,
    /// or as `object+0xoff` inside a loaded object no symbol covers.
    pub fn symbolize(&self, addr: u64) -> String {
        match self.containing(addr) {
            Some(f) if f.entry == addr => f.name.clone(),
            Some(f) => format!("{}+{:#x}", f.name, addr - f.entry),
            None => match self.image_containing(addr) {
                Some(img) => format!("{}+{:#x}", img.name, addr - img.start),
                None => format!("{:#x}", addr),
            },
        }
    }
}
