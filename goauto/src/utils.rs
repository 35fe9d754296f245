// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, bail};
use log::debug;
use nix::mount::{MsFlags, mount};

use crate::errors::AutoError;

pub(crate) fn online_cpu_ids() -> Result<Vec<u32>, AutoError> {
    aya::util::online_cpus().map_err(|(_, e)| AutoError::from(e))
}

pub(crate) fn online_cpu_count() -> Result<u64, AutoError> {
    online_cpu_ids().map(|cpus| cpus.len() as u64)
}

// Section-backed maps carry the data of the object file itself and are
// never shared, so they stay unpinned.
pub(crate) fn should_map_be_pinned(name: &str) -> bool {
    !(name.contains(".rodata") || name.contains(".bss") || name.contains(".data"))
}

pub fn create_bpffs(directory: &str) -> anyhow::Result<()> {
    debug!("Creating bpffs at {directory}");
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
    mount::<str, str, str, str>(None, directory, Some("bpf"), flags, None)
        .with_context(|| format!("unable to create bpffs at {directory}"))
}

pub(crate) fn is_bpffs_mounted(directory: &str) -> Result<bool, anyhow::Error> {
    let file = File::open("/proc/mounts").context("Failed to open /proc/mounts")?;
    let reader = BufReader::new(file);
    for l in reader.lines() {
        match l {
            Ok(line) => {
                let parts: Vec<&str> = line.split(' ').collect();
                if parts.len() != 6 {
                    bail!("expected 6 parts in proc mount")
                }
                if parts[1] == directory && parts[2] == "bpf" {
                    return Ok(true);
                }
            }
            Err(e) => bail!("problem reading lines {}", e),
        }
    }
    Ok(false)
}
