// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Loading one probe against one target: inject constants into the
//! collection spec, load it, pin its maps under the per-target BPFFS
//! directory, and attach every declared uprobe at its resolved offsets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use aya::programs::UProbe;
use aya::programs::uprobe::UProbeLinkId;
use aya::{Ebpf, EbpfLoader};
use log::{debug, warn};

use crate::analyzer::{Arch, TargetDetails};
use crate::errors::AutoError;
use crate::inject::resolve_consts;
use crate::offsets::OffsetCatalog;
use crate::probe::{FailureMode, ProbeManifest, UprobeSpec};
use crate::sampling::{GO_CONTEXT_MAP, TRACKED_SPANS_MAP};
use crate::utils::should_map_be_pinned;

/// The well-known perf output map every probe exposes.
pub const EVENTS_MAP: &str = "events";

/// One loaded probe: the collection, its pinned maps, and the attachment
/// links. Dropped in strictly reverse order of allocation.
pub struct LoadedProbe {
    name: &'static str,
    ebpf: Ebpf,
    links: Vec<(String, UProbeLinkId)>,
}

impl LoadedProbe {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hand the `events` map to the perf reader. The reader owns it from
    /// here on; closing the reader is the cancellation primitive.
    pub fn take_events_map(&mut self) -> Result<aya::maps::Map, AutoError> {
        self.ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| AutoError::Error(format!("probe {} has no {EVENTS_MAP} map", self.name)))
    }

    pub fn ebpf_mut(&mut self) -> &mut Ebpf {
        &mut self.ebpf
    }

    /// Detach every uprobe in reverse attach order, then drop the
    /// collection. Pins stay behind until the per-target directory is
    /// removed.
    pub fn close(mut self) {
        for (program_name, link_id) in std::mem::take(&mut self.links).into_iter().rev() {
            let Some(program) = self.ebpf.program_mut(&program_name) else {
                continue;
            };
            let uprobe: Result<&mut UProbe, _> = program.try_into();
            match uprobe {
                Ok(uprobe) => {
                    if let Err(e) = uprobe.detach(link_id) {
                        warn!("failed to detach {program_name}: {e}");
                    }
                }
                Err(e) => warn!("program {program_name} is not a uprobe: {e}"),
            }
        }
        debug!("closed probe {}", self.name);
    }
}

fn arch_dir(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 => "x86_64",
        Arch::Aarch64 => "arm64",
    }
}

/// Load and attach one probe. All-or-nothing up to the per-uprobe failure
/// modes: constant resolution or a required attach failing aborts the
/// whole probe.
pub fn load_probe(
    manifest: &ProbeManifest,
    target: &TargetDetails,
    catalog: &OffsetCatalog,
    bytecode_dir: &Path,
    pin_dir: &Path,
) -> Result<LoadedProbe, AutoError> {
    manifest.validate()?;

    let object_path: PathBuf = bytecode_dir
        .join(arch_dir(target.arch))
        .join(manifest.object_file);
    let bytecode = std::fs::read(&object_path)?;

    let consts = resolve_consts(&manifest.consts, target, catalog)?;

    let mut loader = EbpfLoader::new();
    loader.map_pin_path(pin_dir);
    for (key, value) in &consts {
        // Every immediate must be predeclared by the eBPF object.
        loader.set_global(key, value.as_slice(), true);
    }
    let mut ebpf = loader.load(&bytecode)?;

    // Pin maps for cross-probe sharing; a map already pinned by an earlier
    // probe of this target is reused through the loader's pin path.
    for (map_name, map) in ebpf.maps_mut() {
        if !should_map_be_pinned(map_name) {
            continue;
        }
        let pin_path = pin_dir.join(map_name);
        if pin_path.exists() {
            // Cross-probe maps (go_context_to_sc, tracked_spans_by_sc)
            // are shared through their pins.
            debug!("reusing pinned map {map_name} for probe {}", manifest.name);
            continue;
        }
        map.pin(&pin_path).map_err(AutoError::UnableToPinMap)?;
        if map_name == TRACKED_SPANS_MAP || map_name == GO_CONTEXT_MAP {
            debug!("pinned shared map {map_name} at {}", pin_path.display());
        }
    }

    let mut links = Vec::new();
    let mut loaded_programs: HashSet<&'static str> = HashSet::new();
    for spec in &manifest.uprobes {
        if let Err(e) = attach_spec(
            &mut ebpf,
            manifest,
            spec,
            target,
            &mut loaded_programs,
            &mut links,
        ) {
            // Unwind the links attached so far before reporting.
            LoadedProbe {
                name: manifest.name,
                ebpf,
                links,
            }
            .close();
            return Err(e);
        }
    }

    debug!(
        "probe {} attached with {} links for pid {}",
        manifest.name,
        links.len(),
        target.pid
    );
    Ok(LoadedProbe {
        name: manifest.name,
        ebpf,
        links,
    })
}

fn attach_spec(
    ebpf: &mut Ebpf,
    manifest: &ProbeManifest,
    spec: &UprobeSpec,
    target: &TargetDetails,
    loaded_programs: &mut HashSet<&'static str>,
    links: &mut Vec<(String, UProbeLinkId)>,
) -> Result<(), AutoError> {
    if let Some(constraint) = &spec.constraint {
        let satisfied = target
            .module_version(manifest.package)
            .is_some_and(|v| constraint.req.matches(v));
        if !satisfied {
            return apply_failure_mode(
                constraint.failure_mode,
                spec.symbol,
                AutoError::Error(format!(
                    "{} does not satisfy {}",
                    manifest.package, constraint.req
                )),
            );
        }
    }

    let Some(function) = target.function(spec.symbol) else {
        return apply_failure_mode(
            spec.failure_mode,
            spec.symbol,
            AutoError::Error(format!("{} not found in target", spec.symbol)),
        );
    };

    if let Some(program_name) = spec.entry_program {
        let result = attach_at(
            ebpf,
            program_name,
            function.entry_offset,
            target,
            loaded_programs,
            links,
        );
        if let Err(e) = result {
            apply_failure_mode(spec.failure_mode, spec.symbol, e)?;
        }
    }

    if let Some(program_name) = spec.return_program {
        for offset in &function.return_offsets {
            let result = attach_at(ebpf, program_name, *offset, target, loaded_programs, links);
            if let Err(e) = result {
                apply_failure_mode(spec.failure_mode, spec.symbol, e)?;
            }
        }
    }
    Ok(())
}

fn attach_at(
    ebpf: &mut Ebpf,
    program_name: &'static str,
    offset: u64,
    target: &TargetDetails,
    loaded_programs: &mut HashSet<&'static str>,
    links: &mut Vec<(String, UProbeLinkId)>,
) -> Result<(), AutoError> {
    let program = ebpf
        .program_mut(program_name)
        .ok_or_else(|| AutoError::BpfFunctionNameNotValid(program_name.to_string()))?;
    let uprobe: &mut UProbe = program.try_into()?;
    if loaded_programs.insert(program_name) {
        uprobe.load()?;
    }
    let link_id = uprobe.attach(None, offset, &target.exe_path, Some(target.pid))?;
    links.push((program_name.to_string(), link_id));
    Ok(())
}

/// Required uprobes abort the probe; optional ones log and continue.
fn apply_failure_mode(
    mode: FailureMode,
    symbol: &str,
    error: AutoError,
) -> Result<(), AutoError> {
    match mode {
        FailureMode::Error => Err(AutoError::UprobeAttachFailed {
            symbol: symbol.to_string(),
            source: Box::new(error),
        }),
        FailureMode::Warn => {
            warn!("skipping uprobe for {symbol}: {error}");
            Ok(())
        }
        FailureMode::Ignore => {
            debug!("skipping uprobe for {symbol}: {error}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use semver::Version;

    use super::*;
    use crate::offsets::STD_MODULE;

    #[test]
    fn test_arch_dir() {
        assert_eq!(arch_dir(Arch::X86_64), "x86_64");
        assert_eq!(arch_dir(Arch::Aarch64), "arm64");
    }

    #[test]
    fn test_missing_bytecode_object() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manifest = crate::probe::http_server::manifest();
        let mut modules = BTreeMap::new();
        modules.insert(STD_MODULE.to_string(), Version::new(1, 22, 0));
        let target = TargetDetails {
            pid: 1,
            exe_path: "/proc/1/exe".into(),
            arch: Arch::X86_64,
            go_version: Version::new(1, 22, 0),
            modules,
            allocation: None,
            functions: vec![],
        };
        // Fails on the object read, before any kernel interaction.
        let result = load_probe(
            &manifest,
            &target,
            &OffsetCatalog::default(),
            dir.path(),
            dir.path(),
        );
        assert_matches!(result, Err(AutoError::IoError(_)));
    }

    #[test]
    fn test_failure_modes() {
        let error = || AutoError::Error("attach failed".to_string());
        assert_matches!(
            apply_failure_mode(FailureMode::Error, "main.main", error()),
            Err(AutoError::UprobeAttachFailed { .. })
        );
        assert_matches!(
            apply_failure_mode(FailureMode::Warn, "main.main", error()),
            Ok(())
        );
        assert_matches!(
            apply_failure_mode(FailureMode::Ignore, "main.main", error()),
            Ok(())
        );
    }
}
