// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Target introspection: parse the executable of a running process to find
//! its Go version, module dependency versions, and the file offsets of the
//! functions the registered probes instrument.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use log::{debug, warn};
use semver::Version;

use crate::allocator::AllocationDetails;
use crate::errors::AutoError;
use crate::offsets::{STD_MODULE, parse_version};

pub(crate) mod buildinfo;
pub(crate) mod elf;

pub mod disasm;

pub use disasm::Arch;

// Go switched from a stack-based to a register-based calling convention
// with this release.
const REGISTERS_ABI_VERSION: Version = Version::new(1, 17, 0);

/// One instrumented function inside the target executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Fully-qualified symbol name, e.g. `net/http.serverHandler.ServeHTTP`.
    pub symbol: String,
    /// File offset of the function entry.
    pub entry_offset: u64,
    /// File offsets of every return instruction, ascending.
    pub return_offsets: Vec<u64>,
}

/// Everything the probe plane needs to know about one traced process.
/// Immutable once analysis completes.
#[derive(Debug, Clone)]
pub struct TargetDetails {
    pub pid: i32,
    pub exe_path: PathBuf,
    pub arch: Arch,
    pub go_version: Version,
    /// Import path -> module version, with [`STD_MODULE`] mapped to the Go
    /// version itself.
    pub modules: BTreeMap<String, Version>,
    pub allocation: Option<AllocationDetails>,
    pub functions: Vec<Function>,
}

impl TargetDetails {
    pub fn module_version(&self, module: &str) -> Option<&Version> {
        self.modules.get(module)
    }

    pub fn function(&self, symbol: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }

    /// True for runtimes that pass arguments in registers.
    pub fn is_registers_abi(&self) -> bool {
        self.go_version >= REGISTERS_ABI_VERSION
    }
}

/// Analyze `/proc/<pid>/exe` against the set of symbols requested by the
/// registered probes.
pub fn analyze(pid: i32, requested: &HashSet<String>) -> Result<TargetDetails, AutoError> {
    let exe_path = PathBuf::from(format!("/proc/{pid}/exe"));
    let data = std::fs::read(&exe_path)?;
    let file = object::File::parse(&*data)
        .map_err(|e| AutoError::Error(format!("unable to parse target ELF: {e}")))?;
    let arch = Arch::try_from(object::Object::architecture(&file))?;
    let segments = elf::load_segments(&file);

    let build_info = buildinfo::parse_build_info(&data, &segments)?;
    let go_version = parse_version(&build_info.go_version)
        .map_err(|e| AutoError::Error(e.to_string()))?;
    debug!("pid {pid} runs go {go_version}");

    let mut modules = BTreeMap::new();
    modules.insert(STD_MODULE.to_string(), go_version.clone());
    for (path, version) in build_info.deps {
        match parse_version(&version) {
            Ok(v) => {
                modules.insert(path, v);
            }
            Err(_) => debug!("skipping module {path} with unparseable version {version}"),
        }
    }

    let symbols = elf::resolve_symbols(&file, requested)?;
    if symbols.is_empty() {
        return Err(AutoError::NoMatchingFunctions);
    }

    let mut functions = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let Some(segment) = elf::exec_segment_for(&segments, symbol.address) else {
            warn!(
                "symbol {} at {:#x} lies outside every executable segment",
                symbol.name, symbol.address
            );
            continue;
        };
        let entry_offset = symbol.address - segment.vaddr + segment.file_offset;

        let start = (entry_offset as usize).min(data.len());
        let end = ((entry_offset + symbol.size).min(data.len() as u64) as usize).max(start);
        let return_offsets: Vec<u64> = disasm::return_offsets(arch, &data[start..end])
            .into_iter()
            .map(|rel| entry_offset + rel)
            .collect();
        if return_offsets.is_empty() {
            // Entry events will still fire, but no span can ever end.
            warn!("no return instructions found in {}", symbol.name);
        }

        functions.push(Function {
            symbol: symbol.name,
            entry_offset,
            return_offsets,
        });
    }

    if functions.is_empty() {
        return Err(AutoError::NoMatchingFunctions);
    }

    Ok(TargetDetails {
        pid,
        exe_path,
        arch,
        go_version,
        modules,
        allocation: None,
        functions,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn details() -> TargetDetails {
        let mut modules = BTreeMap::new();
        modules.insert(STD_MODULE.to_string(), Version::new(1, 22, 0));
        modules.insert(
            "google.golang.org/grpc".to_string(),
            Version::new(1, 63, 0),
        );
        TargetDetails {
            pid: 42,
            exe_path: PathBuf::from("/proc/42/exe"),
            arch: Arch::X86_64,
            go_version: Version::new(1, 22, 0),
            modules,
            allocation: None,
            functions: vec![Function {
                symbol: "net/http.serverHandler.ServeHTTP".to_string(),
                entry_offset: 0x1000,
                return_offsets: vec![0x1040, 0x1088],
            }],
        }
    }

    #[test]
    fn test_registers_abi_cutover() {
        let mut target = details();
        assert!(target.is_registers_abi());
        target.go_version = Version::new(1, 16, 9);
        assert!(!target.is_registers_abi());
        target.go_version = Version::new(1, 17, 0);
        assert!(target.is_registers_abi());
    }

    #[test]
    fn test_function_lookup() {
        let target = details();
        assert!(target.function("net/http.serverHandler.ServeHTTP").is_some());
        assert!(target.function("main.main").is_none());
    }
}
