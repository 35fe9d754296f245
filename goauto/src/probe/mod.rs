// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Probe manifests: the static declaration of every instrumentation unit,
//! plus the registry the orchestrator filters per target.

use std::collections::HashSet;

use log::{debug, warn};
use opentelemetry::trace::SpanKind;
use semver::VersionReq;

use crate::analyzer::TargetDetails;
use crate::errors::AutoError;
use crate::inject::Const;
use crate::span::{BootClock, SpanEvent};

pub mod database_sql;
pub mod event;
pub mod grpc_client;
pub mod grpc_server;
pub mod http_client;
pub mod http_server;
pub mod loader;
pub mod mux_router;
pub mod otel_api;
pub mod reader;

/// What to do when an attach (or version-constraint check) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Abort the probe load.
    #[default]
    Error,
    /// Log and continue without the uprobe.
    Warn,
    /// Continue silently.
    Ignore,
}

/// A supported-version window for the instrumented package, checked before
/// attaching the uprobe that declares it.
#[derive(Debug, Clone)]
pub struct PackageConstraint {
    pub req: VersionReq,
    pub failure_mode: FailureMode,
}

/// One instrumented symbol with its entry and/or return eBPF programs. A
/// spec declaring neither program is invalid.
#[derive(Debug, Clone)]
pub struct UprobeSpec {
    pub symbol: &'static str,
    pub entry_program: Option<&'static str>,
    pub return_program: Option<&'static str>,
    pub failure_mode: FailureMode,
    pub constraint: Option<PackageConstraint>,
}

/// Whether a probe needs every declared function present in the target
/// (conjunctive) or any one of them (disjunctive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSetMatch {
    Any,
    All,
}

/// How the reader turns raw perf records into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// The record is the probe's fixed C layout.
    Struct,
    /// The record leads with a discriminator byte: 0 carries a
    /// size-prefixed telemetry payload, 1 asks the probe to unload.
    Discriminated,
}

/// Builds a [`SpanEvent`] from one decoded record. Returning `Ok(None)`
/// drops the record.
pub type ProcessFn = fn(&[u8], &EventContext) -> Result<Option<SpanEvent>, AutoError>;

/// Per-target state shared with every probe's event processing.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub clock: BootClock,
    pub go_version: semver::Version,
}

pub struct ProbeManifest {
    /// Stable identifier, also the registry key: one load per target.
    pub name: &'static str,
    /// Import path of the instrumented package (`std` for the standard
    /// library).
    pub package: &'static str,
    pub span_kind: SpanKind,
    /// Object file under the per-architecture bytecode directory.
    pub object_file: &'static str,
    pub function_match: FunctionSetMatch,
    pub consts: Vec<Const>,
    pub uprobes: Vec<UprobeSpec>,
    pub decode: DecodeMode,
    pub process: ProcessFn,
}

impl ProbeManifest {
    pub fn symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.uprobes.iter().map(|u| u.symbol)
    }

    pub fn validate(&self) -> Result<(), AutoError> {
        for uprobe in &self.uprobes {
            if uprobe.entry_program.is_none() && uprobe.return_program.is_none() {
                return Err(AutoError::Error(format!(
                    "probe {}: uprobe {} declares neither an entry nor a return program",
                    self.name, uprobe.symbol
                )));
            }
        }
        Ok(())
    }

    /// The FilterUnusedInstrumentors decision for one target.
    pub fn applies_to(&self, target: &TargetDetails) -> bool {
        if self.package != crate::offsets::STD_MODULE
            && target.module_version(self.package).is_none()
        {
            debug!(
                "skipping probe {}: target does not import {}",
                self.name, self.package
            );
            return false;
        }

        let present = self
            .uprobes
            .iter()
            .filter(|u| target.function(u.symbol).is_some())
            .count();
        match self.function_match {
            FunctionSetMatch::Any => {
                if present == 0 {
                    debug!(
                        "skipping probe {}: none of its functions are present",
                        self.name
                    );
                    return false;
                }
                true
            }
            FunctionSetMatch::All => {
                if present == self.uprobes.len() {
                    return true;
                }
                if present > 0 {
                    warn!(
                        "skipping probe {}: only {present} of {} functions present",
                        self.name,
                        self.uprobes.len()
                    );
                } else {
                    debug!(
                        "skipping probe {}: none of its functions are present",
                        self.name
                    );
                }
                false
            }
        }
    }
}

// Manifest version requirements are static strings; a typo is a
// programming error caught by the registry test.
pub(crate) fn version_req(req: &str) -> VersionReq {
    VersionReq::parse(req).expect("static version requirement parses")
}

/// Every supported instrumentation unit.
pub fn registry() -> Vec<ProbeManifest> {
    vec![
        http_server::manifest(),
        http_client::manifest(),
        grpc_client::manifest(),
        grpc_server::manifest(),
        mux_router::manifest(),
        database_sql::manifest(),
        otel_api::manifest(),
    ]
}

/// Union of the symbols all registered probes instrument; drives symbol
/// resolution during target analysis.
pub fn requested_symbols(manifests: &[ProbeManifest]) -> HashSet<String> {
    manifests
        .iter()
        .flat_map(|m| m.symbols())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use semver::Version;

    use super::*;
    use crate::analyzer::{Arch, Function};
    use crate::offsets::STD_MODULE;

    fn target_with(symbols: &[&str], modules: &[(&str, Version)]) -> TargetDetails {
        let mut module_map = BTreeMap::new();
        module_map.insert(STD_MODULE.to_string(), Version::new(1, 22, 0));
        for (path, version) in modules {
            module_map.insert(path.to_string(), version.clone());
        }
        TargetDetails {
            pid: 1,
            exe_path: PathBuf::from("/proc/1/exe"),
            arch: Arch::X86_64,
            go_version: Version::new(1, 22, 0),
            modules: module_map,
            allocation: None,
            functions: symbols
                .iter()
                .enumerate()
                .map(|(i, s)| Function {
                    symbol: s.to_string(),
                    entry_offset: 0x1000 + i as u64 * 0x100,
                    return_offsets: vec![0x1040 + i as u64 * 0x100],
                })
                .collect(),
        }
    }

    #[test]
    fn test_registry_is_valid() {
        let manifests = registry();
        assert!(!manifests.is_empty());
        let mut names = HashSet::new();
        for manifest in &manifests {
            manifest.validate().expect("manifest valid");
            assert!(names.insert(manifest.name), "duplicate name {}", manifest.name);
            assert!(!manifest.uprobes.is_empty());
        }
    }

    #[test]
    fn test_invalid_uprobe_rejected() {
        let manifest = ProbeManifest {
            name: "test/empty",
            package: STD_MODULE,
            span_kind: SpanKind::Internal,
            object_file: "empty.o",
            function_match: FunctionSetMatch::Any,
            consts: vec![],
            uprobes: vec![UprobeSpec {
                symbol: "main.main",
                entry_program: None,
                return_program: None,
                failure_mode: FailureMode::Error,
                constraint: None,
            }],
            decode: DecodeMode::Struct,
            process: |_, _| Ok(None),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_filter_disjunctive() {
        let manifest = http_server::manifest();
        assert_eq!(manifest.function_match, FunctionSetMatch::Any);
        let present = target_with(&[manifest.uprobes[0].symbol], &[]);
        assert!(manifest.applies_to(&present));
        let absent = target_with(&["main.main"], &[]);
        assert!(!manifest.applies_to(&absent));
    }

    #[test]
    fn test_filter_requires_module() {
        let manifest = grpc_client::manifest();
        let symbols: Vec<&str> = manifest.symbols().collect();
        let without_module = target_with(&symbols, &[]);
        assert!(!manifest.applies_to(&without_module));
        let with_module = target_with(
            &symbols,
            &[("google.golang.org/grpc", Version::new(1, 63, 0))],
        );
        assert!(manifest.applies_to(&with_module));
    }

    #[test]
    fn test_requested_symbols_union() {
        let manifests = registry();
        let symbols = requested_symbols(&manifests);
        assert!(symbols.contains("net/http.serverHandler.ServeHTTP"));
        assert!(symbols.len() >= manifests.len());
    }
}
