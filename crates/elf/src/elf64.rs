//! ELF64 little-endian reader.
//!
//! Only the parts needed to find function symbols are decoded: the file
//! header, program headers (for the load bias), section headers and symbol
//! tables.

use crate::error::ElfError;

/// ELF64 header size
pub const ELF64_EHDR_SIZE: usize = 64;
/// ELF64 program header size
pub const ELF64_PHDR_SIZE: usize = 56;
/// ELF64 section header size
pub const ELF64_SHDR_SIZE: usize = 64;
/// ELF64 symbol entry size
pub const ELF64_SYM_SIZE: usize = 24;

/// ELF magic number
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;
/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF type: executable
pub const ET_EXEC: u16 = 2;
/// ELF type: shared object (also position-independent executables)
pub const ET_DYN: u16 = 3;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Section type: static symbol table
pub const SHT_SYMTAB: u32 = 2;
/// Section type: dynamic symbol table
pub const SHT_DYNSYM: u32 = 11;

/// Symbol type: function
pub const STT_FUNC: u8 = 2;
/// Symbol type: indirect function resolved at load time
pub const STT_GNU_IFUNC: u8 = 10;
/// Undefined section index
pub const SHN_UNDEF: u16 = 0;

fn read_u16(data: &[u8], offset: usize) -> Result<u16, ElfError> {
    let bytes = data.get(offset..offset + 2).ok_or(ElfError::Truncated { offset })?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ElfError> {
    let bytes = data.get(offset..offset + 4).ok_or(ElfError::Truncated { offset })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, ElfError> {
    let bytes = data.get(offset..offset + 8).ok_or(ElfError::Truncated { offset })?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(word))
}

/// Decoded file header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phnum: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: u32,
    pub kind: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub entsize: u64,
}

/// A symbol as stored in the file, before relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: u8,
    pub shndx: u16,
}

impl RawSymbol {
    /// Defined function with a body.
    pub fn is_defined_function(&self) -> bool {
        self.kind == STT_FUNC && self.shndx != SHN_UNDEF && self.value != 0
    }
}

/// A parsed ELF64 image borrowing its bytes.
pub struct ElfFile<'a> {
    data: &'a [u8],
    pub header: Header,
}

impl<'a> ElfFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < ELF64_EHDR_SIZE || data[0..4] != ELF_MAGIC {
            return Err(ElfError::NotElf);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::Unsupported("only little-endian ELF64 is supported".to_string()));
        }
        let header = Header {
            kind: read_u16(data, 16)?,
            machine: read_u16(data, 18)?,
            entry: read_u64(data, 24)?,
            phoff: read_u64(data, 32)?,
            shoff: read_u64(data, 40)?,
            phnum: read_u16(data, 56)?,
            shnum: read_u16(data, 60)?,
            shstrndx: read_u16(data, 62)?,
        };
        Ok(Self { data, header })
    }

    pub fn is_position_independent(&self) -> bool {
        self.header.kind == ET_DYN
    }

    pub fn program_headers(&self) -> Result<Vec<ProgramHeader>, ElfError> {
        (0..self.header.phnum as usize)
            .map(|i| {
                let base = self.header.phoff as usize + i * ELF64_PHDR_SIZE;
                Ok(ProgramHeader {
                    kind: read_u32(self.data, base)?,
                    flags: read_u32(self.data, base + 4)?,
                    offset: read_u64(self.data, base + 8)?,
                    vaddr: read_u64(self.data, base + 16)?,
                    filesz: read_u64(self.data, base + 32)?,
                    memsz: read_u64(self.data, base + 40)?,
                })
            })
            .collect()
    }

    /// Virtual address of the first loadable segment.
    pub fn first_load_vaddr(&self) -> Result<Option<u64>, ElfError> {
        Ok(self.program_headers()?.into_iter().find(|ph| ph.kind == PT_LOAD).map(|ph| ph.vaddr))
    }

    pub fn sections(&self) -> Result<Vec<SectionHeader>, ElfError> {
        (0..self.header.shnum as usize)
            .map(|i| {
                let base = self.header.shoff as usize + i * ELF64_SHDR_SIZE;
                Ok(SectionHeader {
                    name: read_u32(self.data, base)?,
                    kind: read_u32(self.data, base + 4)?,
                    addr: read_u64(self.data, base + 16)?,
                    offset: read_u64(self.data, base + 24)?,
                    size: read_u64(self.data, base + 32)?,
                    link: read_u32(self.data, base + 40)?,
                    entsize: read_u64(self.data, base + 56)?,
                })
            })
            .collect()
    }

    fn string_at(&self, table: &SectionHeader, index: u32) -> Result<String, ElfError> {
        let start = table.offset as usize + index as usize;
        let end = (table.offset + table.size) as usize;
        let bytes = self.data.get(start..end).ok_or(ElfError::Truncated { offset: start })?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    pub fn section_name(&self, section: &SectionHeader) -> Result<String, ElfError> {
        let sections = self.sections()?;
        let strtab = sections
            .get(self.header.shstrndx as usize)
            .ok_or_else(|| ElfError::Unsupported("missing section name table".to_string()))?;
        self.string_at(strtab, section.name)
    }

    /// Symbols of the first section of type `kind` (`SHT_SYMTAB` or
    /// `SHT_DYNSYM`). Returns `None` when the image has no such section.
    pub fn symbols(&self, kind: u32) -> Result<Option<Vec<RawSymbol>>, ElfError> {
        let sections = self.sections()?;
        let Some(table) = sections.iter().find(|s| s.kind == kind) else {
            return Ok(None);
        };
        let strtab = sections
            .get(table.link as usize)
            .ok_or_else(|| ElfError::Unsupported("symbol table without string table".to_string()))?;

        let entsize = if table.entsize == 0 { ELF64_SYM_SIZE } else { table.entsize as usize };
        let count = table.size as usize / entsize;
        let mut symbols = Vec::with_capacity(count);
        for i in 0..count {
            let base = table.offset as usize + i * entsize;
            let name = read_u32(self.data, base)?;
            let info = *self.data.get(base + 4).ok_or(ElfError::Truncated { offset: base + 4 })?;
            symbols.push(RawSymbol {
                name: self.string_at(strtab, name)?,
                kind: info & 0xf,
                shndx: read_u16(self.data, base + 6)?,
                value: read_u64(self.data, base + 8)?,
                size: read_u64(self.data, base + 16)?,
            });
        }
        Ok(Some(symbols))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a small ET_DYN image with one PT_LOAD at `load_vaddr`, a
    /// `.text` section and a symbol table of the given `kind`.
    pub(crate) fn build_image(load_vaddr: u64, symtab_kind: u32, symbols: &[(&str, u64, u64, u8, u16)]) -> Vec<u8> {
        let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0".to_vec();
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; ELF64_SYM_SIZE];
        for &(name, value, size, kind, shndx) in symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            let mut sym = [0u8; ELF64_SYM_SIZE];
            sym[0..4].copy_from_slice(&name_off.to_le_bytes());
            sym[4] = 0x10 | kind;
            sym[6..8].copy_from_slice(&shndx.to_le_bytes());
            sym[8..16].copy_from_slice(&value.to_le_bytes());
            sym[16..24].copy_from_slice(&size.to_le_bytes());
            symtab.extend_from_slice(&sym);
        }

        let phoff = ELF64_EHDR_SIZE;
        let symtab_off = phoff + ELF64_PHDR_SIZE;
        let strtab_off = symtab_off + symtab.len();
        let shstrtab_off = strtab_off + strtab.len();
        let shoff = (shstrtab_off + shstrtab.len() + 7) & !7;

        let mut data = vec![0u8; shoff];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[6] = 1;
        data[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        data[18..20].copy_from_slice(&62u16.to_le_bytes());
        data[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        data[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        data[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
        data[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
        data[56..58].copy_from_slice(&1u16.to_le_bytes());
        data[58..60].copy_from_slice(&(ELF64_SHDR_SIZE as u16).to_le_bytes());
        data[60..62].copy_from_slice(&5u16.to_le_bytes());
        data[62..64].copy_from_slice(&4u16.to_le_bytes());

        data[phoff..phoff + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        data[phoff + 16..phoff + 24].copy_from_slice(&load_vaddr.to_le_bytes());

        data[symtab_off..strtab_off].copy_from_slice(&symtab);
        data[strtab_off..shstrtab_off].copy_from_slice(&strtab);
        data[shstrtab_off..shstrtab_off + shstrtab.len()].copy_from_slice(&shstrtab);

        // (name, type, offset, size, link, entsize)
        let sections: [(u32, u32, usize, usize, u32, u64); 5] = [
            (0, 0, 0, 0, 0, 0),
            (1, 1, 0, 0, 0, 0),
            (7, symtab_kind, symtab_off, symtab.len(), 3, ELF64_SYM_SIZE as u64),
            (15, 3, strtab_off, strtab.len(), 0, 0),
            (23, 3, shstrtab_off, shstrtab.len(), 0, 0),
        ];
        for (name, kind, offset, size, link, entsize) in sections {
            let mut sh = [0u8; ELF64_SHDR_SIZE];
            sh[0..4].copy_from_slice(&name.to_le_bytes());
            sh[4..8].copy_from_slice(&kind.to_le_bytes());
            sh[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
            sh[32..40].copy_from_slice(&(size as u64).to_le_bytes());
            sh[40..44].copy_from_slice(&link.to_le_bytes());
            sh[56..64].copy_from_slice(&entsize.to_le_bytes());
            data.extend_from_slice(&sh);
        }
        data
    }

    #[test]
    fn test_rejects_non_elf() {
        assert!(matches!(ElfFile::parse(b"#!/bin/sh\n"), Err(ElfError::NotElf)));
        let mut data = build_image(0, SHT_SYMTAB, &[]);
        data[4] = 1;
        assert!(matches!(ElfFile::parse(&data), Err(ElfError::Unsupported(_))));
    }

    #[test]
    fn test_header_and_load_segment() {
        let data = build_image(0x1000, SHT_SYMTAB, &[]);
        let elf = ElfFile::parse(&data).unwrap();
        assert!(elf.is_position_independent());
        assert_eq!(elf.header.machine, 62);
        assert_eq!(elf.first_load_vaddr().unwrap(), Some(0x1000));
    }

    #[test]
    fn test_section_names() {
        let data = build_image(0, SHT_SYMTAB, &[]);
        let elf = ElfFile::parse(&data).unwrap();
        let names: Vec<String> = elf.sections().unwrap().iter().map(|s| elf.section_name(s).unwrap()).collect();
        assert_eq!(names, vec!["", ".text", ".symtab", ".strtab", ".shstrtab"]);
    }

    #[test]
    fn test_symbols() {
        let data = build_image(0, SHT_SYMTAB, &[("worker", 0x1130, 42, STT_FUNC, 1), ("puts", 0, 0, STT_FUNC, SHN_UNDEF)]);
        let elf = ElfFile::parse(&data).unwrap();
        assert_eq!(elf.symbols(SHT_DYNSYM).unwrap(), None);
        let symbols = elf.symbols(SHT_SYMTAB).unwrap().unwrap();
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[1].name, "worker");
        assert_eq!(symbols[1].value, 0x1130);
        assert_eq!(symbols[1].size, 42);
        assert!(symbols[1].is_defined_function());
        assert!(!symbols[2].is_defined_function());
    }

    #[test]
    fn test_truncated_image() {
        let data = build_image(0, SHT_SYMTAB, &[("worker", 0x1130, 42, STT_FUNC, 1)]);
        let cut = &data[..data.len() - 10];
        let elf = ElfFile::parse(cut).unwrap();
        assert!(matches!(elf.sections(), Err(ElfError::Truncated { .. })));
    }
}
