//! Function symbols of the running process.
//!
//! Reads the ELF images listed in `/proc/self/maps` and builds a
//! [`SymbolTable`] of every defined function at its runtime address, with a
//! [`FunctionKind`] telling the engine whether the function may be
//! instrumented.

pub mod elf64;
pub mod error;
pub mod filter;
pub mod loader;
pub mod maps;
pub mod symbols;

pub use error::ElfError;
pub use filter::SymbolFilter;
pub use loader::{load_image, load_process_symbols, ImageRole};
pub use symbols::{Function, FunctionKind, ImageRange, SymbolTable};
