// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! ELF segment and symbol resolution for the target executable. Symbols
//! come from `.symtab` when the binary carries one, otherwise from the Go
//! line table (`.gopclntab`).

use std::collections::HashSet;

use object::{Object as _, ObjectSection as _, ObjectSegment as _, ObjectSymbol as _};

use crate::errors::AutoError;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentInfo {
    pub vaddr: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SymbolInfo {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

pub(crate) fn load_segments(file: &object::File) -> Vec<SegmentInfo> {
    file.segments()
        .map(|seg| {
            let (file_offset, file_size) = seg.file_range();
            let executable = match seg.flags() {
                object::SegmentFlags::Elf { p_flags } => p_flags & object::elf::PF_X != 0,
                _ => false,
            };
            SegmentInfo {
                vaddr: seg.address(),
                file_offset,
                file_size,
                executable,
            }
        })
        .collect()
}

/// The single executable loadable segment containing `vaddr`.
pub(crate) fn exec_segment_for(segments: &[SegmentInfo], vaddr: u64) -> Option<&SegmentInfo> {
    segments
        .iter()
        .find(|s| s.executable && vaddr >= s.vaddr && vaddr < s.vaddr + s.file_size)
}

/// Resolve the requested fully-qualified symbols to `(address, size)`.
pub(crate) fn resolve_symbols(
    file: &object::File,
    requested: &HashSet<String>,
) -> Result<Vec<SymbolInfo>, AutoError> {
    if file.symbols().next().is_some() {
        let mut symbols: Vec<SymbolInfo> = file
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                requested.contains(name).then(|| SymbolInfo {
                    name: name.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();
        symbols.sort_by(|a, b| a.address.cmp(&b.address));
        return Ok(symbols);
    }

    let Some(section) = file.section_by_name(".gopclntab") else {
        return Err(AutoError::NoSymbolTable);
    };
    let data = section.data().map_err(|_| AutoError::NoSymbolTable)?;
    pclntab_symbols(data, requested)
}

// Line-table header magics by Go release line.
const PCLNTAB_MAGIC_116: u32 = 0xffff_fffa;
const PCLNTAB_MAGIC_118: u32 = 0xffff_fff0;
const PCLNTAB_MAGIC_120: u32 = 0xffff_fff1;

struct PclnReader<'a> {
    data: &'a [u8],
    ptr_size: usize,
}

impl<'a> PclnReader<'a> {
    fn u32_at(&self, off: usize) -> Option<u32> {
        let bytes = self.data.get(off..off + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn word_at(&self, off: usize) -> Option<u64> {
        if self.ptr_size == 4 {
            self.u32_at(off).map(u64::from)
        } else {
            let bytes = self.data.get(off..off + 8)?;
            Some(u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]))
        }
    }

    // Header word `i`, following the 8-byte magic/pad/quantum/ptrsize
    // preamble.
    fn header_word(&self, i: usize) -> Option<u64> {
        self.word_at(8 + i * self.ptr_size)
    }

    fn name_at(&self, funcname_base: u64, name_off: u32) -> Option<String> {
        let start = funcname_base as usize + name_off as usize;
        let rest = self.data.get(start..)?;
        let end = rest.iter().position(|b| *b == 0)?;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

/// Walk the Go function table. Supports the 1.16, 1.18 and 1.20 layouts;
/// anything older counts as having no usable symbol table.
fn pclntab_symbols(
    data: &[u8],
    requested: &HashSet<String>,
) -> Result<Vec<SymbolInfo>, AutoError> {
    if data.len() < 8 {
        return Err(AutoError::NoSymbolTable);
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let ptr_size = data[7] as usize;
    if ptr_size != 4 && ptr_size != 8 {
        return Err(AutoError::NoSymbolTable);
    }
    let reader = PclnReader { data, ptr_size };

    let mut symbols = Vec::new();
    match magic {
        PCLNTAB_MAGIC_118 | PCLNTAB_MAGIC_120 => {
            let nfunc = reader.header_word(0).ok_or(AutoError::NoSymbolTable)? as usize;
            let text_start = reader.header_word(2).ok_or(AutoError::NoSymbolTable)?;
            let funcname_base = reader.header_word(3).ok_or(AutoError::NoSymbolTable)?;
            let pcln_base = reader.header_word(7).ok_or(AutoError::NoSymbolTable)?;

            // functab entries are (entry offset, func offset) u32 pairs,
            // with one trailing end sentinel.
            let entry_at = |i: usize| reader.u32_at(pcln_base as usize + i * 8);
            for i in 0..nfunc {
                let (Some(entry_off), Some(func_off), Some(next_entry_off)) =
                    (entry_at(i), reader.u32_at(pcln_base as usize + i * 8 + 4), entry_at(i + 1))
                else {
                    break;
                };
                let func_base = pcln_base as usize + func_off as usize;
                let Some(name_off) = reader.u32_at(func_base + 4) else {
                    continue;
                };
                let Some(name) = reader.name_at(funcname_base, name_off) else {
                    continue;
                };
                if requested.contains(&name) {
                    symbols.push(SymbolInfo {
                        name,
                        address: text_start + u64::from(entry_off),
                        size: u64::from(next_entry_off.saturating_sub(entry_off)),
                    });
                }
            }
        }
        PCLNTAB_MAGIC_116 => {
            let nfunc = reader.header_word(0).ok_or(AutoError::NoSymbolTable)? as usize;
            let funcname_base = reader.header_word(2).ok_or(AutoError::NoSymbolTable)?;
            let pcln_base = reader.header_word(6).ok_or(AutoError::NoSymbolTable)?;

            // functab entries are (entry vaddr, func offset) pointer pairs.
            let pair = |i: usize| {
                let off = pcln_base as usize + i * 2 * ptr_size;
                Some((reader.word_at(off)?, reader.word_at(off + ptr_size)?))
            };
            for i in 0..nfunc {
                let (Some((entry, func_off)), Some((next_entry, _))) = (pair(i), pair(i + 1))
                else {
                    break;
                };
                let func_base = pcln_base as usize + func_off as usize;
                let Some(name_off) = reader.u32_at(func_base + ptr_size) else {
                    continue;
                };
                let Some(name) = reader.name_at(funcname_base, name_off) else {
                    continue;
                };
                if requested.contains(&name) {
                    symbols.push(SymbolInfo {
                        name,
                        address: entry,
                        size: next_entry.saturating_sub(entry),
                    });
                }
            }
        }
        _ => return Err(AutoError::NoSymbolTable),
    }

    symbols.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(symbols)
}
