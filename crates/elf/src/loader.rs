//! Loading function symbols for the images mapped into this process.

use std::fs;
use std::path::Path;

use racetrap_common::debug::create_logger;
use racetrap_common::{align_down, log, log_detail, log_fail};

use crate::elf64::{ElfFile, SHT_DYNSYM, SHT_SYMTAB};
use crate::error::ElfError;
use crate::filter::SymbolFilter;
use crate::maps::{mapped_images, parse_maps};
use crate::symbols::{Function, FunctionKind, ImageRange, SymbolTable};

const PAGE_SIZE: u64 = 0x1000;

/// Which part an image plays in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// The executable itself; its functions are classified by the filter
    Main,
    /// A shared object; its exports are recorded as dynamic functions
    Shared,
}

/// Add the functions of one image, mapped at `base`, to `table`. Returns the
/// number of functions added.
pub fn load_image(
    table: &mut SymbolTable,
    filter: &SymbolFilter,
    data: &[u8],
    base: u64,
    role: ImageRole,
) -> Result<usize, ElfError> {
    let elf = ElfFile::parse(data)?;
    let bias = if elf.is_position_independent() {
        base.wrapping_sub(align_down(elf.first_load_vaddr()?.unwrap_or(0), PAGE_SIZE))
    } else {
        0
    };

    let symbols = match role {
        ImageRole::Main => match elf.symbols(SHT_SYMTAB)? {
            Some(symbols) => Some(symbols),
            None => elf.symbols(SHT_DYNSYM)?,
        },
        ImageRole::Shared => elf.symbols(SHT_DYNSYM)?,
    };

    let mut added = 0;
    for sym in symbols.unwrap_or_default() {
        if !sym.is_defined_function() {
            continue;
        }
        let kind = match role {
            ImageRole::Main => filter.classify(&sym.name),
            ImageRole::Shared => FunctionKind::Dynamic,
        };
        if kind == FunctionKind::Normal && sym.size == 0 {
            continue;
        }
        table.insert(Function { name: sym.name, entry: sym.value.wrapping_add(bias), size: sym.size, kind });
        added += 1;
    }
    Ok(added)
}

fn read(path: &Path) -> Result<Vec<u8>, ElfError> {
    fs::read(path).map_err(|source| ElfError::Io { path: path.to_path_buf(), source })
}

/// Resolve functions of the running process from `/proc/self/maps`.
///
/// The main executable must load; shared objects that cannot be read or
/// parsed are skipped.
pub fn load_process_symbols(filter: &SymbolFilter) -> Result<SymbolTable, ElfError> {
    let log = create_logger("elf");
    let maps_path = Path::new("/proc/self/maps");
    let maps = fs::read_to_string(maps_path).map_err(|source| ElfError::Io { path: maps_path.to_path_buf(), source })?;
    let exe_link = Path::new("/proc/self/exe");
    let exe = fs::read_link(exe_link).map_err(|source| ElfError::Io { path: exe_link.to_path_buf(), source })?;

    let mut table = SymbolTable::new();
    let mut saw_main = false;
    for image in mapped_images(&parse_maps(&maps)?) {
        let role = if image.path == exe { ImageRole::Main } else { ImageRole::Shared };
        let result = read(&image.path).and_then(|data| load_image(&mut table, filter, &data, image.base, role));
        match (result, role) {
            (Ok(count), _) => {
                log_detail!(log, "{}: {} functions at base {:#x}", image.path.display(), count, image.base);
                let name = image.path.file_name().unwrap_or(image.path.as_os_str()).to_string_lossy().into_owned();
                table.add_image(ImageRange { name, start: image.base, end: image.end });
                saw_main |= role == ImageRole::Main;
            }
            (Err(err), ImageRole::Main) => return Err(err),
            (Err(err), ImageRole::Shared) => {
                log_fail!(log, "skipping {}: {}", image.path.display(), err);
            }
        }
    }

    if !saw_main {
        return Err(ElfError::MainImageMissing(exe));
    }
    log!(log, "resolved {} functions", table.len());
    Ok(table)
}
