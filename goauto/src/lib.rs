// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Zero-code eBPF auto-instrumentation for Go applications.
//!
//! goauto discovers running Go processes, inspects their executables for
//! runtime and dependency versions plus function offsets, attaches uprobes
//! through the kernel, and turns the resulting event stream into
//! OpenTelemetry spans exported over OTLP.
//!
//! The top-level entry point is [`Manager`]: build one from a [`Config`]
//! and drive it with a shutdown channel.

use anyhow::Context as _;
use log::debug;
use nix::libc::RLIM_INFINITY;
use nix::sys::resource::{Resource, setrlimit};

use crate::utils::{create_bpffs, is_bpffs_mounted};

pub mod allocator;
pub mod analyzer;
pub mod config;
pub mod discover;
pub mod errors;
pub mod export;
pub mod inject;
pub mod manager;
pub mod offsets;
pub mod probe;
pub mod sampling;
pub mod span;
pub mod utils;

pub use crate::config::Config;
pub use crate::errors::AutoError;
pub use crate::manager::Manager;

pub mod directories {
    // ConfigurationDirectory: /etc/goauto/
    pub const CFGDIR: &str = "/etc/goauto";
    pub const CFGPATH_GOAUTO_CONFIG: &str = "/etc/goauto/goauto.toml";

    // Pre-compiled eBPF object files, one subdirectory per architecture.
    pub const DEFAULT_BYTECODE_DIR: &str = "/usr/lib/goauto/bpf";

    // Per-target map pins live in <BPFFS_ROOT>/<pid>/.
    pub const BPFFS_ROOT: &str = "/sys/fs/bpf";
}

/// Prepare the process for loading eBPF: lift the memlock limit and make
/// sure the BPF filesystem is available.
pub fn initialize_goauto(config: &Config) -> anyhow::Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .context("must be privileged to run goauto")?;

    let bpffs_root = config.bpffs_root.to_string_lossy();
    std::fs::create_dir_all(&*config.bpffs_root)
        .with_context(|| format!("unable to create {bpffs_root}"))?;
    if !is_bpffs_mounted(&bpffs_root)? {
        create_bpffs(&bpffs_root)?;
    }
    debug!("bpffs available at {bpffs_root}");
    Ok(())
}
