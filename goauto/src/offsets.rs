// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Version-indexed catalog of struct-field byte offsets, loaded from a JSON
//! manifest. The catalog is immutable after load and shared by every
//! target's constant injector.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::errors::{AutoError, ParseError};

/// The standard-library pseudo-module. Fields under it are versioned by the
/// target's Go runtime version rather than a dependency version.
pub const STD_MODULE: &str = "std";

/// Identifies one struct field: `(module, package, struct, field)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructFieldId {
    pub module: String,
    pub package: String,
    pub strct: String,
    pub field: String,
}

impl StructFieldId {
    pub fn new(
        module: impl Into<String>,
        package: impl Into<String>,
        strct: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            package: package.into(),
            strct: strct.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for StructFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}.{}",
            self.module, self.package, self.strct, self.field
        )
    }
}

/// The versioned offsets known for a single struct field.
#[derive(Debug, Clone, Default)]
struct FieldOffsets {
    by_version: HashMap<Version, u64>,
    // Set when every known version shares one offset. Serves lookups for
    // unofficial builds whose version strings carry commit hashes.
    uniform: Option<u64>,
}

impl FieldOffsets {
    fn insert(&mut self, version: Version, offset: u64) {
        self.by_version.insert(version, offset);
        let mut distinct = self.by_version.values();
        let first = distinct.next().copied();
        self.uniform = if distinct.all(|o| Some(*o) == first) {
            first
        } else {
            None
        };
    }

    fn get(&self, version: &Version) -> Option<u64> {
        self.by_version.get(version).copied().or(self.uniform)
    }
}

/// The manifest wire shape:
/// `{"data":[{module, packages:[{package, structs:[{struct, fields:[{field,
/// offsets:[{offset, versions:[..]}]}]}]}]}]}`.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    data: Vec<ModuleEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModuleEntry {
    module: String,
    packages: Vec<PackageEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackageEntry {
    package: String,
    structs: Vec<StructEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StructEntry {
    #[serde(rename = "struct")]
    name: String,
    fields: Vec<FieldEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldEntry {
    field: String,
    offsets: Vec<OffsetEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetEntry {
    offset: u64,
    versions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCatalog {
    fields: HashMap<StructFieldId, FieldOffsets>,
}

impl OffsetCatalog {
    /// The catalog shipped with the release.
    pub fn embedded() -> Result<Self, AutoError> {
        Self::from_json(include_str!("offset_results.json"))
    }

    pub fn from_json(raw: &str) -> Result<Self, AutoError> {
        let manifest: Manifest = serde_json::from_str(raw)
            .map_err(|e| AutoError::ConfigError("invalid offset manifest".to_string(), e.to_string()))?;

        let mut catalog = OffsetCatalog::default();
        for module in manifest.data {
            for package in module.packages {
                for strct in package.structs {
                    for field in strct.fields {
                        let id = StructFieldId::new(
                            module.module.clone(),
                            package.package.clone(),
                            strct.name.clone(),
                            field.field.clone(),
                        );
                        let entry = catalog.fields.entry(id).or_default();
                        for offset in field.offsets {
                            for version in offset.versions {
                                let version =
                                    parse_version(&version).map_err(|e| {
                                        AutoError::ConfigError(
                                            "invalid offset manifest".to_string(),
                                            e.to_string(),
                                        )
                                    })?;
                                entry.insert(version, offset.offset);
                            }
                        }
                    }
                }
            }
        }
        Ok(catalog)
    }

    /// Serialize in canonical order: modules, packages, structs and fields
    /// lexicographic; offsets ascending; versions semver-ascending.
    pub fn to_json(&self) -> String {
        type FieldMap = BTreeMap<String, BTreeMap<u64, Vec<Version>>>;
        type StructMap = BTreeMap<String, FieldMap>;
        type PackageMap = BTreeMap<String, StructMap>;
        let mut modules: BTreeMap<String, PackageMap> = BTreeMap::new();

        for (id, offsets) in &self.fields {
            let by_offset = modules
                .entry(id.module.clone())
                .or_default()
                .entry(id.package.clone())
                .or_default()
                .entry(id.strct.clone())
                .or_default()
                .entry(id.field.clone())
                .or_default();
            for (version, offset) in &offsets.by_version {
                by_offset.entry(*offset).or_default().push(version.clone());
            }
        }

        let data = modules
            .into_iter()
            .map(|(module, packages)| ModuleEntry {
                module,
                packages: packages
                    .into_iter()
                    .map(|(package, structs)| PackageEntry {
                        package,
                        structs: structs
                            .into_iter()
                            .map(|(name, fields)| StructEntry {
                                name,
                                fields: fields
                                    .into_iter()
                                    .map(|(field, offsets)| FieldEntry {
                                        field,
                                        offsets: offsets
                                            .into_iter()
                                            .map(|(offset, mut versions)| {
                                                versions.sort();
                                                OffsetEntry {
                                                    offset,
                                                    versions: versions
                                                        .iter()
                                                        .map(Version::to_string)
                                                        .collect(),
                                                }
                                            })
                                            .collect(),
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        serde_json::to_string_pretty(&Manifest { data })
            .unwrap_or_else(|_| "{\"data\":[]}".to_string())
    }

    /// Exact semver match, falling back to the uniform offset when the
    /// field has never changed across known versions.
    pub fn get(&self, id: &StructFieldId, version: &Version) -> Option<u64> {
        self.fields.get(id).and_then(|f| f.get(version))
    }

    pub fn contains(&self, id: &StructFieldId) -> bool {
        self.fields.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl PartialEq for OffsetCatalog {
    fn eq(&self, other: &Self) -> bool {
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields.iter().all(|(id, offsets)| {
            other
                .fields
                .get(id)
                .is_some_and(|o| o.by_version == offsets.by_version)
        })
    }
}

/// Vendored import paths are resolved under the vendored module's own name.
pub fn unvendor(path: &str) -> &str {
    match path.rsplit_once("/vendor/") {
        Some((_, rest)) => rest,
        None => path,
    }
}

/// Parse Go-flavored version strings: `go1.21.4`, `v1.2.3`, `1.21`
/// (missing patch), pseudo-versions with pre-release/build suffixes.
pub fn parse_version(value: &str) -> Result<Version, ParseError> {
    let trimmed = value
        .trim()
        .trim_start_matches("go")
        .trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Ok(v);
    }
    // Two-component versions ("1.21") drop the patch level.
    let core_len = trimmed
        .find(['-', '+'])
        .unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(core_len);
    if core.split('.').count() == 2 {
        let padded = format!("{}.0{}", core, rest);
        if let Ok(v) = Version::parse(&padded) {
            return Ok(v);
        }
    }
    Err(ParseError::InvalidVersion {
        value: value.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const MANIFEST: &str = r#"{
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
        },
        {
          "module": "std",
          "packages": [
            {
              "package": "net/http",
              "structs": [
                {
                  "struct": "Request",
                  "fields": [
                    {
                      "field": "Method",
                      "offsets": [
                        { "offset": 0, "versions": ["1.20.0", "1.21.0", "1.22.0"] }
                      ]
                    }
                  ]
                }
              ]
            }
          ]
        }
      ]
    }"#;

    fn stream_method() -> StructFieldId {
        StructFieldId::new(
            "google.golang.org/grpc",
            "google.golang.org/grpc/internal/transport",
            "Stream",
            "method",
        )
    }

    #[test]
    fn test_versioned_lookup() {
        let catalog = OffsetCatalog::from_json(MANIFEST).expect("manifest parses");
        let id = stream_method();
        assert_eq!(
            catalog.get(&id, &Version::new(1, 14, 9)),
            Some(80),
            "1.14.9"
        );
        assert_eq!(catalog.get(&id, &Version::new(1, 15, 0)), Some(64), "1.15.0");
        assert_eq!(
            catalog.get(&id, &Version::new(1, 37, 1)),
            Some(80),
            "1.37.1"
        );
        // No exact match and more than one distinct offset: not found.
        assert_eq!(catalog.get(&id, &Version::new(1, 16, 0)), None);
    }

    #[test]
    fn test_uniform_fallback() {
        let catalog = OffsetCatalog::from_json(MANIFEST).expect("manifest parses");
        let id = StructFieldId::new(STD_MODULE, "net/http", "Request", "Method");
        // 1.23.4 is unknown to the catalog but the offset never changed.
        assert_eq!(catalog.get(&id, &Version::new(1, 23, 4)), Some(0));
    }

    #[test]
    fn test_unknown_field() {
        let catalog = OffsetCatalog::from_json(MANIFEST).expect("manifest parses");
        let id = StructFieldId::new(STD_MODULE, "net/http", "Request", "URL");
        assert!(!catalog.contains(&id));
        assert_eq!(catalog.get(&id, &Version::new(1, 21, 0)), None);
    }

    #[test]
    fn test_canonical_roundtrip() {
        let catalog = OffsetCatalog::from_json(MANIFEST).expect("manifest parses");
        let serialized = catalog.to_json();
        let reparsed = OffsetCatalog::from_json(&serialized).expect("canonical form parses");
        assert_eq!(catalog, reparsed);
        // Canonical form is a fixed point.
        assert_eq!(serialized, reparsed.to_json());
    }

    #[test]
    fn test_embedded_catalog_parses() {
        let catalog = OffsetCatalog::embedded().expect("embedded catalog parses");
        assert!(!catalog.is_empty());
    }

    #[test]
    fn test_unvendor() {
        assert_eq!(
            unvendor("github.com/acme/app/vendor/google.golang.org/grpc"),
            "google.golang.org/grpc"
        );
        assert_eq!(unvendor("google.golang.org/grpc"), "google.golang.org/grpc");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("go1.21.4").unwrap(), Version::new(1, 21, 4));
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("1.21").unwrap(), Version::new(1, 21, 0));
        assert!(parse_version("v0.0.0-20221118152302-e6195bd50e26").is_ok());
        assert!(parse_version("not-a-version").is_err());
    }
}
