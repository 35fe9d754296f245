// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Return-instruction discovery. Return uprobes are attached at every RET
//! inside a function body, so the scan has to be exact: x86-64 needs a real
//! variable-length decode, arm64 is a fixed 4-byte stride.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};

use crate::errors::AutoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl TryFrom<object::Architecture> for Arch {
    type Error = AutoError;

    fn try_from(arch: object::Architecture) -> Result<Self, Self::Error> {
        match arch {
            object::Architecture::X86_64 => Ok(Arch::X86_64),
            object::Architecture::Aarch64 => Ok(Arch::Aarch64),
            other => Err(AutoError::Error(format!(
                "unsupported target architecture {other:?}"
            ))),
        }
    }
}

/// Offsets (relative to the start of `code`) of every return instruction.
pub fn return_offsets(arch: Arch, code: &[u8]) -> Vec<u64> {
    match arch {
        Arch::X86_64 => x86_return_offsets(code),
        Arch::Aarch64 => aarch64_return_offsets(code),
    }
}

fn x86_return_offsets(code: &[u8]) -> Vec<u64> {
    let mut offsets = Vec::new();
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            continue;
        }
        if instruction.mnemonic() == Mnemonic::Ret {
            offsets.push(instruction.ip());
        }
    }
    offsets
}

// RET is `1101011_0010_11111_000000_Rn_00000`; Rn is almost always x30 but
// the encoding allows any register.
const AARCH64_RET_MASK: u32 = 0xffff_fc1f;
const AARCH64_RET_BITS: u32 = 0xd65f_0000;

fn aarch64_return_offsets(code: &[u8]) -> Vec<u64> {
    code.chunks_exact(4)
        .enumerate()
        .filter_map(|(i, word)| {
            let insn = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            (insn & AARCH64_RET_MASK == AARCH64_RET_BITS).then_some((i * 4) as u64)
        })
        .collect()
}
