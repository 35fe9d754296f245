// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Resolves the constants a probe manifest declares against one target's
//! version map and produces the named immediates stamped into the eBPF
//! collection spec before load.

use log::debug;
use semver::Version;

use crate::analyzer::TargetDetails;
use crate::errors::AutoError;
use crate::offsets::{OffsetCatalog, StructFieldId, unvendor};

pub const KEY_ALLOC_START: &str = "start_addr";
pub const KEY_ALLOC_END: &str = "end_addr";
pub const KEY_TOTAL_CPUS: &str = "total_cpus";
pub const KEY_REGISTERS_ABI: &str = "is_registers_abi";

/// One constant declaration in a probe manifest.
#[derive(Debug, Clone)]
pub enum Const {
    /// A struct-field byte offset looked up by the target's module version.
    StructField { key: &'static str, id: StructFieldId },
    /// As [`Const::StructField`], but only injected when the module is at
    /// least `min_version`; below it the constant is silently skipped.
    StructFieldMinVersion {
        key: &'static str,
        id: StructFieldId,
        min_version: Version,
    },
    /// The remote arena window: emits `start_addr`, `end_addr` and
    /// `total_cpus`.
    Allocation,
    /// Emits `is_registers_abi` for the Go calling-convention cutover.
    RegistersAbi,
    /// A literal.
    KeyVal { key: &'static str, value: ConstValue },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    U64(u64),
    U32(u32),
    Bool(bool),
}

impl ConstValue {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            ConstValue::U64(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U32(v) => v.to_ne_bytes().to_vec(),
            ConstValue::Bool(v) => vec![v as u8],
        }
    }
}

/// Resolve every constant of one probe. All-or-nothing: any failure other
/// than an unmet minimum version aborts the probe's load.
pub fn resolve_consts(
    consts: &[Const],
    target: &TargetDetails,
    catalog: &OffsetCatalog,
) -> Result<Vec<(String, Vec<u8>)>, AutoError> {
    let mut resolved = Vec::new();
    for decl in consts {
        match resolve_one(decl, target, catalog) {
            Ok(pairs) => resolved.extend(pairs),
            Err(AutoError::MinVersionNotMet {
                module,
                version,
                min_version,
            }) => {
                debug!(
                    "skipping constant for {module} {version}: below minimum {min_version}"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(resolved)
}

fn resolve_one(
    decl: &Const,
    target: &TargetDetails,
    catalog: &OffsetCatalog,
) -> Result<Vec<(String, Vec<u8>)>, AutoError> {
    match decl {
        Const::StructField { key, id } => {
            let offset = field_offset(id, target, catalog, None)?;
            Ok(vec![(key.to_string(), offset.to_ne_bytes().to_vec())])
        }
        Const::StructFieldMinVersion {
            key,
            id,
            min_version,
        } => {
            let offset = field_offset(id, target, catalog, Some(min_version))?;
            Ok(vec![(key.to_string(), offset.to_ne_bytes().to_vec())])
        }
        Const::Allocation => {
            let allocation = target.allocation.ok_or_else(|| {
                AutoError::RemoteMmapFailed {
                    pid: target.pid,
                    reason: "no allocation window reserved for this target".to_string(),
                }
            })?;
            Ok(vec![
                (
                    KEY_ALLOC_START.to_string(),
                    allocation.start_addr.to_ne_bytes().to_vec(),
                ),
                (
                    KEY_ALLOC_END.to_string(),
                    allocation.end_addr.to_ne_bytes().to_vec(),
                ),
                (
                    KEY_TOTAL_CPUS.to_string(),
                    allocation.num_cpus.to_ne_bytes().to_vec(),
                ),
            ])
        }
        Const::RegistersAbi => Ok(vec![(
            KEY_REGISTERS_ABI.to_string(),
            vec![target.is_registers_abi() as u8],
        )]),
        Const::KeyVal { key, value } => Ok(vec![(key.to_string(), value.to_bytes())]),
    }
}

fn field_offset(
    id: &StructFieldId,
    target: &TargetDetails,
    catalog: &OffsetCatalog,
    min_version: Option<&Version>,
) -> Result<u64, AutoError> {
    let module = unvendor(&id.module);
    let version = target.module_version(module).ok_or_else(|| {
        AutoError::UnknownModuleVersion {
            module: module.to_string(),
            field: id.to_string(),
        }
    })?;

    if let Some(min) = min_version {
        if version < min {
            return Err(AutoError::MinVersionNotMet {
                module: module.to_string(),
                version: version.to_string(),
                min_version: min.to_string(),
            });
        }
    }

    let lookup = StructFieldId::new(module, &*id.package, &*id.strct, &*id.field);
    if !catalog.contains(&lookup) {
        return Err(AutoError::UnknownStructField(lookup));
    }
    catalog.get(&lookup, version).ok_or_else(|| {
        AutoError::Error(format!("no known offset for {lookup} at version {version}"))
    })
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use assert_matches::assert_matches;

    use super::*;
    use crate::analyzer::{Arch, TargetDetails};
    use crate::offsets::STD_MODULE;

    const GRPC: &str = "google.golang.org/grpc";

    fn catalog() -> OffsetCatalog {
        OffsetCatalog::from_json(
            r#"{
              "data": [
                {
                  "module": "google.golang.org/grpc",
                  "packages": [
                    {
                      "package": "google.golang.org/grpc/internal/transport",
                      "structs": [
                        {
                          "struct": "Stream",
                          "fields": [
                            {
                              "field": "method",
                              "offsets": [
                                { "offset": 80, "versions": ["1.14.9", "1.37.1"] },
                                { "offset": 64, "versions": ["1.15.0"] }
                              ]
                            }
                          ]
                        }
                      ]
                    }
                  ]
                }
              ]
            }"#,
        )
        .expect("catalog parses")
    }

    fn target(grpc_version: Version) -> TargetDetails {
        let mut modules = BTreeMap::new();
        modules.insert(STD_MODULE.to_string(), Version::new(1, 22, 0));
        modules.insert(GRPC.to_string(), grpc_version);
        TargetDetails {
            pid: 7,
            exe_path: PathBuf::from("/proc/7/exe"),
            arch: Arch::X86_64,
            go_version: Version::new(1, 22, 0),
            modules,
            allocation: Some(crate::allocator::AllocationDetails {
                start_addr: 0x7000_0000,
                end_addr: 0x7000_0000 + 15 * 1024 * 1024,
                num_cpus: 4,
            }),
            functions: vec![],
        }
    }

    fn stream_method() -> StructFieldId {
        StructFieldId::new(
            GRPC,
            "google.golang.org/grpc/internal/transport",
            "Stream",
            "method",
        )
    }

    #[test]
    fn test_version_appropriate_offsets() {
        let catalog = catalog();
        let decl = Const::StructField {
            key: "stream_method_ptr_pos",
            id: stream_method(),
        };
        for (version, expected) in [
            (Version::new(1, 14, 9), 80u64),
            (Version::new(1, 15, 0), 64),
            (Version::new(1, 37, 1), 80),
        ] {
            let resolved =
                resolve_consts(&[decl.clone()], &target(version), &catalog).expect("resolves");
            assert_eq!(resolved.len(), 1);
            assert_eq!(resolved[0].0, "stream_method_ptr_pos");
            assert_eq!(resolved[0].1, expected.to_ne_bytes().to_vec());
        }
    }

    #[test]
    fn test_vendored_module_lookup() {
        let catalog = catalog();
        let mut id = stream_method();
        id.module = format!("example.com/app/vendor/{GRPC}");
        let decl = Const::StructField {
            key: "stream_method_ptr_pos",
            id,
        };
        let resolved = resolve_consts(&[decl], &target(Version::new(1, 15, 0)), &catalog)
            .expect("vendored module resolves");
        assert_eq!(resolved[0].1, 64u64.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_unknown_module() {
        let catalog = catalog();
        let mut target = target(Version::new(1, 15, 0));
        target.modules.remove(GRPC);
        let decl = Const::StructField {
            key: "stream_method_ptr_pos",
            id: stream_method(),
        };
        assert_matches!(
            resolve_consts(&[decl], &target, &catalog),
            Err(AutoError::UnknownModuleVersion { .. })
        );
    }

    #[test]
    fn test_unknown_struct_field() {
        let catalog = catalog();
        let decl = Const::StructField {
            key: "stream_id_pos",
            id: StructFieldId::new(
                GRPC,
                "google.golang.org/grpc/internal/transport",
                "Stream",
                "id",
            ),
        };
        assert_matches!(
            resolve_consts(&[decl], &target(Version::new(1, 15, 0)), &catalog),
            Err(AutoError::UnknownStructField(_))
        );
    }

    #[test]
    fn test_min_version_skips_constant() {
        let catalog = catalog();
        let decl = Const::StructFieldMinVersion {
            key: "stream_method_ptr_pos",
            id: stream_method(),
            min_version: Version::new(1, 20, 0),
        };
        // Below the minimum: the key must be absent, and nothing fails.
        let resolved = resolve_consts(&[decl.clone()], &target(Version::new(1, 15, 0)), &catalog)
            .expect("skip is not an error");
        assert!(resolved.iter().all(|(k, _)| k != "stream_method_ptr_pos"));

        // At or above it: injected as usual.
        let resolved = resolve_consts(&[decl], &target(Version::new(1, 37, 1)), &catalog)
            .expect("resolves");
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_allocation_and_abi_consts() {
        let catalog = catalog();
        let resolved = resolve_consts(
            &[Const::Allocation, Const::RegistersAbi],
            &target(Version::new(1, 15, 0)),
            &catalog,
        )
        .expect("resolves");
        let keys: Vec<&str> = resolved.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![KEY_ALLOC_START, KEY_ALLOC_END, KEY_TOTAL_CPUS, KEY_REGISTERS_ABI]
        );
        assert_eq!(resolved[3].1, vec![1u8]);
    }

    #[test]
    fn test_allocation_missing_window() {
        let catalog = catalog();
        let mut target = target(Version::new(1, 15, 0));
        target.allocation = None;
        assert_matches!(
            resolve_consts(&[Const::Allocation], &target, &catalog),
            Err(AutoError::RemoteMmapFailed { .. })
        );
    }
}
