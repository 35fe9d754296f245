// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use thiserror::Error;

use crate::offsets::StructFieldId;

#[derive(Debug, Error)]
pub enum AutoError {
    #[error("An error occurred. {0}")]
    Error(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    BpfLoadError(#[from] aya::EbpfError),
    #[error(transparent)]
    BpfProgramError(#[from] aya::programs::ProgramError),
    #[error(transparent)]
    BpfMapError(#[from] aya::maps::MapError),
    #[error(transparent)]
    BpfPerfBufferError(#[from] aya::maps::perf::PerfBufferError),
    #[error("Failed to pin map {0}")]
    UnableToPinMap(#[source] aya::pin::PinError),
    #[error("Unable to find a valid program with function name {0}")]
    BpfFunctionNameNotValid(String),
    #[error("target does not import module {module} (requested for {field})")]
    UnknownModuleVersion { module: String, field: String },
    #[error("{0} is not present in the offset catalog")]
    UnknownStructField(StructFieldId),
    #[error("module {module} version {version} is below the minimum {min_version}")]
    MinVersionNotMet {
        module: String,
        version: String,
        min_version: String,
    },
    #[error("the target binary carries no symbol table")]
    NoSymbolTable,
    #[error("none of the requested functions are present in the target binary")]
    NoMatchingFunctions,
    #[error("ptrace attach to tid {tid} failed: {source}")]
    PtraceAttachFailed { tid: i32, source: nix::Error },
    #[error("remote mmap in pid {pid} failed: {reason}")]
    RemoteMmapFailed { pid: i32, reason: String },
    #[error("failed to attach uprobe for {symbol}")]
    UprobeAttachFailed {
        symbol: String,
        #[source]
        source: Box<AutoError>,
    },
    #[error("probe {0} is already registered for this target")]
    ProbeAlreadyRegistered(String),
    #[error("unable to decode a {probe} record: {reason}")]
    DecodeFailed { probe: String, reason: String },
    // Sentinel raised when a perf reader is shut down; exits the reader
    // task without logging.
    #[error("perf reader closed")]
    ReaderClosed,
    #[error("sampling fraction {0} cannot be represented without precision loss")]
    PrecisionLoss(f64),
    #[error("sampling fraction {0} is outside [0.0, 1.0]")]
    InvalidFraction(f64),
    #[error("{0}: {1}")]
    ConfigError(String, String),
}

impl AutoError {
    /// True when the failure only matters for probes that declared an
    /// allocation constant. Other probes of the same target keep loading.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            AutoError::PtraceAttachFailed { .. } | AutoError::RemoteMmapFailed { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unable to parse config file")]
    ConfigParseError(#[from] toml::de::Error),
    #[error("{value} is not a valid log level")]
    InvalidLogLevel { value: String },
    #[error("{value} is not a valid sampler name")]
    InvalidSampler { value: String },
    #[error("{value} is not a valid version string")]
    InvalidVersion { value: String },
}
