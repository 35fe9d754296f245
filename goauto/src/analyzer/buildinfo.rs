// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Decoding of the Go build-info blob embedded in every Go executable: the
//! runtime version plus the module dependency listing.

use crate::analyzer::elf::SegmentInfo;
use crate::errors::AutoError;

/// The 14-byte marker that opens the build-info header.
pub(crate) const BUILD_INFO_MAGIC: &[u8; 14] = b"\xff Go buildinf:";

// Header layout: magic, pointer size, flags.
const HDR_PTR_SIZE: usize = 14;
const HDR_FLAGS: usize = 15;
const HDR_LEN: usize = 32;

const FLAG_BIG_ENDIAN: u8 = 0x1;
// Set since Go 1.18: version and module info are inlined after the header
// as varint length-prefixed strings instead of pointer-addressed ones.
const FLAG_INLINE_STRINGS: u8 = 0x2;

// The module summary is wrapped in 16-byte sentinels on both ends.
const MOD_SENTINEL_LEN: usize = 16;

// How far into a loadable region the header may sit.
const SEARCH_WINDOW: usize = 64 * 1024;
const HEADER_ALIGN: usize = 16;

#[derive(Debug, Clone, Default)]
pub(crate) struct RawBuildInfo {
    pub go_version: String,
    /// `(import path, version)` pairs from `dep` lines.
    pub deps: Vec<(String, String)>,
}

pub(crate) fn parse_build_info(
    data: &[u8],
    segments: &[SegmentInfo],
) -> Result<RawBuildInfo, AutoError> {
    let base = find_header(data, segments).ok_or_else(|| {
        AutoError::Error("no Go build-info header in the target binary".to_string())
    })?;

    let header = &data[base..];
    if header.len() < HDR_LEN {
        return Err(AutoError::Error("truncated build-info header".to_string()));
    }
    let ptr_size = header[HDR_PTR_SIZE] as usize;
    let flags = header[HDR_FLAGS];

    let (version, mod_info) = if flags & FLAG_INLINE_STRINGS != 0 {
        read_inline_strings(data, base + HDR_LEN)?
    } else {
        read_pointed_strings(data, segments, base, ptr_size, flags & FLAG_BIG_ENDIAN != 0)?
    };

    if version.is_empty() {
        return Err(AutoError::Error("empty Go version in build info".to_string()));
    }

    Ok(RawBuildInfo {
        go_version: version,
        deps: parse_mod_info(&mod_info),
    })
}

/// Scan the first 64 KiB of each loadable region for the 16-byte aligned
/// header magic.
fn find_header(data: &[u8], segments: &[SegmentInfo]) -> Option<usize> {
    for seg in segments {
        let start = seg.file_offset as usize;
        let end = (seg.file_offset + seg.file_size).min(data.len() as u64) as usize;
        if start >= end {
            continue;
        }
        let window_end = end.min(start + SEARCH_WINDOW);
        let mut off = start;
        while off + HDR_LEN <= window_end {
            if data[off..].starts_with(BUILD_INFO_MAGIC) {
                return Some(off);
            }
            off += HEADER_ALIGN;
        }
    }
    None
}

/// Go >= 1.18: two varint length-prefixed strings directly after the header.
fn read_inline_strings(data: &[u8], start: usize) -> Result<(String, Vec<u8>), AutoError> {
    let (version, next) = read_varint_string(data, start)?;
    let (mod_info, _) = read_varint_string(data, next)?;
    Ok((String::from_utf8_lossy(&version).into_owned(), mod_info))
}

fn read_varint_string(data: &[u8], start: usize) -> Result<(Vec<u8>, usize), AutoError> {
    let (len, consumed) = read_uvarint(&data[start.min(data.len())..])
        .ok_or_else(|| AutoError::Error("bad varint in build info".to_string()))?;
    let begin = start + consumed;
    let end = begin + len as usize;
    if end > data.len() {
        return Err(AutoError::Error("truncated build-info string".to_string()));
    }
    Ok((data[begin..end].to_vec(), end))
}

fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate().take(10) {
        if *byte < 0x80 {
            return Some((value | (u64::from(*byte) << shift), i + 1));
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    None
}

/// Pre-1.18: the header carries two pointers to Go string headers
/// (`{data ptr, len}`), addressed in the target's virtual address space.
fn read_pointed_strings(
    data: &[u8],
    segments: &[SegmentInfo],
    base: usize,
    ptr_size: usize,
    big_endian: bool,
) -> Result<(String, Vec<u8>), AutoError> {
    if ptr_size != 4 && ptr_size != 8 {
        return Err(AutoError::Error(format!(
            "unsupported build-info pointer size {ptr_size}"
        )));
    }
    let version_ptr = read_ptr(data, base + 16, ptr_size, big_endian)?;
    let mod_ptr = read_ptr(data, base + 16 + ptr_size, ptr_size, big_endian)?;
    let version = read_go_string(data, segments, version_ptr, ptr_size, big_endian)?;
    let mod_info = read_go_string(data, segments, mod_ptr, ptr_size, big_endian)?;
    Ok((String::from_utf8_lossy(&version).into_owned(), mod_info))
}

fn read_ptr(data: &[u8], off: usize, ptr_size: usize, big_endian: bool) -> Result<u64, AutoError> {
    let bytes = data
        .get(off..off + ptr_size)
        .ok_or_else(|| AutoError::Error("truncated build-info pointer".to_string()))?;
    let mut value: u64 = 0;
    if big_endian {
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
    } else {
        for b in bytes.iter().rev() {
            value = (value << 8) | u64::from(*b);
        }
    }
    Ok(value)
}

fn read_go_string(
    data: &[u8],
    segments: &[SegmentInfo],
    header_vaddr: u64,
    ptr_size: usize,
    big_endian: bool,
) -> Result<Vec<u8>, AutoError> {
    let header_off = vaddr_to_offset(segments, header_vaddr)
        .ok_or_else(|| AutoError::Error("build-info string outside any segment".to_string()))?;
    let data_ptr = read_ptr(data, header_off as usize, ptr_size, big_endian)?;
    let len = read_ptr(data, header_off as usize + ptr_size, ptr_size, big_endian)?;
    let data_off = vaddr_to_offset(segments, data_ptr)
        .ok_or_else(|| AutoError::Error("build-info string outside any segment".to_string()))?;
    let begin = data_off as usize;
    let end = begin + len as usize;
    if end > data.len() {
        return Err(AutoError::Error("truncated build-info string".to_string()));
    }
    Ok(data[begin..end].to_vec())
}

fn vaddr_to_offset(segments: &[SegmentInfo], vaddr: u64) -> Option<u64> {
    segments
        .iter()
        .find(|s| vaddr >= s.vaddr && vaddr < s.vaddr + s.file_size)
        .map(|s| vaddr - s.vaddr + s.file_offset)
}

/// The module summary is newline-delimited, tab-separated. Only `dep`
/// lines contribute to the module map.
fn parse_mod_info(raw: &[u8]) -> Vec<(String, String)> {
    // The wrapped form ends with `\n` followed by the 16-byte sentinel.
    let trimmed = if raw.len() >= 2 * MOD_SENTINEL_LEN + 1
        && raw[raw.len() - MOD_SENTINEL_LEN - 1] == b'\n'
    {
        &raw[MOD_SENTINEL_LEN..raw.len() - MOD_SENTINEL_LEN]
    } else {
        raw
    };
    let text = String::from_utf8_lossy(trimmed);
    let mut deps = Vec::new();
    for line in text.lines() {
        let mut fields = line.split('\t');
        if fields.next() != Some("dep") {
            continue;
        }
        if let (Some(path), Some(version)) = (fields.next(), fields.next()) {
            deps.push((path.to_string(), version.to_string()));
        }
    }
    deps
}
