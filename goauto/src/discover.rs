// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Periodic `/proc` sweep that decides which processes to instrument and
//! reports the ones that vanished since the previous sweep.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::select;
use tokio::sync::{broadcast, mpsc};

use crate::config::{Config, ENV_SERVICE_NAME};

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

// Infrastructure processes that are never instrumentation targets, matched
// by executable base name.
const DENYLIST: &[&str] = &[
    "containerd",
    "containerd-shim-runc-v2",
    "dockerd",
    "kubelet",
    "pause",
    "runc",
    "systemd",
    "goauto",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Found { pid: i32, service_name: String },
    Gone { pid: i32 },
}

pub struct Discoverer {
    target_exe: Option<String>,
    default_service: Option<String>,
    known: HashSet<i32>,
}

impl Discoverer {
    pub fn new(config: &Config) -> Self {
        Self {
            target_exe: config.target_exe.clone(),
            default_service: config.service_name.clone(),
            known: HashSet::new(),
        }
    }

    /// Sweep every 2 seconds until shutdown. The event channel is dropped
    /// only after the final sweep, so receivers can drain it instead of
    /// racing a close.
    pub async fn run(mut self, events: mpsc::Sender<TargetEvent>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Signal received to stop process discovery");
                    break;
                }
                _ = ticker.tick() => {
                    for event in self.sweep() {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One pass over `/proc`: new targets first, then vanished PIDs.
    pub fn sweep(&mut self) -> Vec<TargetEvent> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        let processes = match procfs::process::all_processes() {
            Ok(processes) => processes,
            Err(e) => {
                warn!("unable to enumerate /proc: {e}");
                return events;
            }
        };

        let own_pid = std::process::id() as i32;
        for process in processes.flatten() {
            let pid = process.pid;
            if pid == own_pid {
                continue;
            }
            let Ok(exe) = process.exe() else {
                // Kernel threads and processes we cannot inspect.
                continue;
            };
            let environ_service = process.environ().ok().and_then(|env| {
                env.get(&OsString::from(ENV_SERVICE_NAME))
                    .map(|v| v.to_string_lossy().into_owned())
            });

            let Some(service_name) = accept(
                self.target_exe.as_deref(),
                self.default_service.as_deref(),
                &exe,
                environ_service.as_deref(),
            ) else {
                continue;
            };

            seen.insert(pid);
            if self.known.insert(pid) {
                debug!("discovered target pid {pid} ({service_name})");
                events.push(TargetEvent::Found { pid, service_name });
            }
        }

        let gone: Vec<i32> = self.known.difference(&seen).copied().collect();
        for pid in gone {
            self.known.remove(&pid);
            events.push(TargetEvent::Gone { pid });
        }
        events
    }
}

/// The acceptance decision: either the executable path contains the
/// configured substring, or the target's environment names a service.
/// Returns the service name to report the target under.
fn accept(
    target_exe: Option<&str>,
    default_service: Option<&str>,
    exe: &Path,
    environ_service: Option<&str>,
) -> Option<String> {
    let base = exe.file_name()?.to_string_lossy();
    if DENYLIST.contains(&base.as_ref()) {
        return None;
    }

    let exe_matches = target_exe
        .is_some_and(|pattern| !pattern.is_empty() && exe.to_string_lossy().contains(pattern));
    if !exe_matches && environ_service.is_none() {
        return None;
    }

    Some(
        environ_service
            .or(default_service)
            .map(str::to_string)
            .unwrap_or_else(|| base.into_owned()),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_accept_by_exe_substring() {
        let exe = PathBuf::from("/usr/local/bin/frontend");
        assert_eq!(
            accept(Some("frontend"), None, &exe, None),
            Some("frontend".to_string())
        );
        assert_eq!(accept(Some("backend"), None, &exe, None), None);
    }

    #[test]
    fn test_accept_by_environ_service() {
        let exe = PathBuf::from("/app/server");
        assert_eq!(
            accept(None, None, &exe, Some("checkout")),
            Some("checkout".to_string())
        );
        assert_eq!(accept(None, None, &exe, None), None);
    }

    #[test]
    fn test_environ_service_wins_over_default() {
        let exe = PathBuf::from("/app/server");
        assert_eq!(
            accept(Some("server"), Some("fallback"), &exe, Some("checkout")),
            Some("checkout".to_string())
        );
        assert_eq!(
            accept(Some("server"), Some("fallback"), &exe, None),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn test_denylist() {
        let exe = PathBuf::from("/usr/bin/dockerd");
        assert_eq!(accept(Some("dockerd"), None, &exe, Some("svc")), None);
    }

    #[test]
    fn test_empty_pattern_does_not_match_everything() {
        let exe = PathBuf::from("/usr/bin/anything");
        assert_eq!(accept(Some(""), None, &exe, None), None);
    }
}
