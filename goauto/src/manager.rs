// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! The per-target lifecycle owner: discovery, analysis, remote allocation,
//! probe load/attach, the running event plane, and teardown including
//! BPFFS cleanup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::allocator;
use crate::analyzer;
use crate::config::Config;
use crate::discover::{Discoverer, TargetEvent};
use crate::errors::AutoError;
use crate::export::{SpanSink, new_sink};
use crate::inject::Const;
use crate::offsets::OffsetCatalog;
use crate::probe::loader::{LoadedProbe, load_probe};
use crate::probe::reader::spawn_readers;
use crate::probe::{EventContext, ProbeManifest, registry, requested_symbols};
use crate::sampling::{self, SamplingConfig};
use crate::span::BootClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Discovered,
    Analyzing,
    Allocating,
    Loading,
    Running,
    TearingDown,
    Closed,
}

fn transition(pid: i32, from: &mut TargetState, to: TargetState) {
    debug!("target {pid}: {from:?} -> {to:?}");
    *from = to;
}

struct TargetHandle {
    service_name: String,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns every instrumented target. One manager per process.
pub struct Manager {
    config: Config,
    catalog: Arc<OffsetCatalog>,
    sink: Arc<dyn SpanSink>,
    sampling: SamplingConfig,
    dropped_spans: Arc<AtomicU64>,
}

impl Manager {
    /// Fails fast on configuration the probes cannot honor (bad sampler,
    /// unloadable catalog, unreachable exporter config).
    pub fn new(config: Config) -> Result<Self, AutoError> {
        let catalog = Arc::new(OffsetCatalog::embedded()?);
        let sampling = sampling::config_for(&config.sampler)?;
        let sink: Arc<dyn SpanSink> = Arc::from(new_sink(&config)?);
        Ok(Self {
            config,
            catalog,
            sink,
            sampling,
            dropped_spans: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Total perf samples lost across all targets, surfaced to the
    /// metrics sink.
    pub fn dropped_spans(&self) -> u64 {
        self.dropped_spans.load(Ordering::Relaxed)
    }

    /// Run discovery and the per-target fan-out until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), AutoError> {
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let (discover_shutdown, _) = broadcast::channel(1);
        let discoverer = Discoverer::new(&self.config);
        let discovery_task =
            tokio::spawn(discoverer.run(events_tx, discover_shutdown.subscribe()));

        let mut targets: HashMap<i32, TargetHandle> = HashMap::new();

        loop {
            select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Signal received to stop instrumentation");
                    break;
                }
                event = events_rx.recv() => {
                    match event {
                        Some(TargetEvent::Found { pid, service_name }) => {
                            if targets.contains_key(&pid) {
                                continue;
                            }
                            info!("instrumenting pid {pid} as {service_name}");
                            targets.insert(pid, self.spawn_target(pid, service_name));
                        }
                        Some(TargetEvent::Gone { pid }) => {
                            if let Some(handle) = targets.remove(&pid) {
                                info!(
                                    "target pid {pid} ({}) exited",
                                    handle.service_name
                                );
                                close_target(handle).await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = discover_shutdown.send(());
        let _ = discovery_task.await;

        for (pid, handle) in targets.drain() {
            debug!("shutting down target pid {pid}");
            close_target(handle).await;
        }
        self.sink.shutdown().await;
        Ok(())
    }

    fn spawn_target(&self, pid: i32, service_name: String) -> TargetHandle {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let worker = TargetWorker {
            pid,
            config: self.config.clone(),
            catalog: self.catalog.clone(),
            sink: self.sink.clone(),
            sampling: self.sampling,
            dropped_spans: self.dropped_spans.clone(),
        };
        let task = tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown_rx).await {
                warn!("target pid {pid} failed: {e}");
            }
        });
        TargetHandle {
            service_name,
            shutdown,
            task,
        }
    }
}

async fn close_target(handle: TargetHandle) {
    let _ = handle.shutdown.send(());
    let _ = handle.task.await;
}

fn needs_allocation(manifest: &ProbeManifest) -> bool {
    manifest
        .consts
        .iter()
        .any(|c| matches!(c, Const::Allocation))
}

/// Guard for the one-load-per-probe invariant.
fn register_probe(
    registered: &mut HashSet<&'static str>,
    name: &'static str,
) -> Result<(), AutoError> {
    if !registered.insert(name) {
        return Err(AutoError::ProbeAlreadyRegistered(name.to_string()));
    }
    Ok(())
}

struct TargetWorker {
    pid: i32,
    config: Config,
    catalog: Arc<OffsetCatalog>,
    sink: Arc<dyn SpanSink>,
    sampling: SamplingConfig,
    dropped_spans: Arc<AtomicU64>,
}

impl TargetWorker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), AutoError> {
        let pid = self.pid;
        let mut state = TargetState::Discovered;

        // Analyzing
        transition(pid, &mut state, TargetState::Analyzing);
        let manifests = registry();
        let requested = requested_symbols(&manifests);
        let mut target = tokio::task::spawn_blocking(move || analyzer::analyze(pid, &requested))
            .await
            .map_err(|e| AutoError::Error(format!("analysis task failed: {e}")))??;

        let mut manifests: Vec<ProbeManifest> = manifests
            .into_iter()
            .filter(|m| m.applies_to(&target))
            .collect();
        if manifests.is_empty() {
            info!("target pid {pid}: nothing to instrument");
            transition(pid, &mut state, TargetState::Closed);
            return Ok(());
        }

        // Allocating, only when some probe declares an allocation const.
        if manifests.iter().any(needs_allocation) {
            transition(pid, &mut state, TargetState::Allocating);
            let allocated = tokio::task::spawn_blocking(move || allocator::allocate(pid))
                .await
                .map_err(|e| AutoError::Error(format!("allocation task failed: {e}")))?;
            match allocated {
                Ok(details) => target.allocation = Some(details),
                Err(e) if e.is_allocation_failure() => {
                    // Only probes that need the arena are affected.
                    warn!("allocation for pid {pid} failed: {e}");
                    manifests.retain(|m| !needs_allocation(m));
                }
                Err(e) => return Err(e),
            }
            if manifests.is_empty() {
                transition(pid, &mut state, TargetState::Closed);
                return Ok(());
            }
        }

        // Loading
        transition(pid, &mut state, TargetState::Loading);
        let pin_dir = self.pin_dir();
        std::fs::create_dir_all(&pin_dir)?;

        let ctx = EventContext {
            clock: BootClock::new(),
            go_version: target.go_version.clone(),
        };
        let (span_tx, mut span_rx) = mpsc::channel(256);
        let (unload_tx, mut unload_rx) = mpsc::channel(8);
        let (reader_shutdown, _) = broadcast::channel(1);

        let mut registered: HashSet<&'static str> = HashSet::new();
        let mut probes: Vec<LoadedProbe> = Vec::new();
        let mut reader_tasks: Vec<JoinHandle<()>> = Vec::new();

        for manifest in &manifests {
            if let Err(e) = register_probe(&mut registered, manifest.name) {
                warn!("{e}");
                continue;
            }
            let mut probe = match load_probe(
                manifest,
                &target,
                &self.catalog,
                &self.config.bytecode_dir,
                &pin_dir,
            ) {
                Ok(probe) => probe,
                Err(e) => {
                    // Partial instrumentation beats none.
                    warn!("probe {} failed to load for pid {pid}: {e}", manifest.name);
                    continue;
                }
            };
            if let Err(e) = sampling::apply(probe.ebpf_mut(), self.sampling) {
                warn!("sampling config for {} not applied: {e}", manifest.name);
            }
            let events_map = probe.take_events_map()?;
            reader_tasks.extend(spawn_readers(
                manifest.name,
                events_map,
                manifest.decode,
                manifest.process,
                ctx.clone(),
                span_tx.clone(),
                unload_tx.clone(),
                self.dropped_spans.clone(),
                &reader_shutdown,
            )?);
            debug!(
                "probe {} ({:?} spans) running for pid {pid}",
                manifest.name, manifest.span_kind
            );
            probes.push(probe);
        }
        // The dispatch loop below must observe reader hangups, not its
        // own clones.
        drop(span_tx);
        drop(unload_tx);

        if probes.is_empty() {
            warn!("no probe attached for pid {pid}");
            let _ = std::fs::remove_dir_all(&pin_dir);
            transition(pid, &mut state, TargetState::Closed);
            return Err(AutoError::Error(format!(
                "all probes failed to attach for pid {pid}"
            )));
        }

        // Running: forward spans until shutdown or the last reader exits.
        transition(pid, &mut state, TargetState::Running);
        loop {
            select! {
                biased;
                _ = shutdown.recv() => break,
                unloaded = unload_rx.recv() => {
                    match unloaded {
                        Some(name) => {
                            info!("probe {name} asked to unload from pid {pid}");
                            if let Some(i) = probes.iter().position(|p| p.name() == name) {
                                probes.remove(i).close();
                            }
                            if probes.is_empty() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                span = span_rx.recv() => {
                    match span {
                        Some(span) => {
                            if let Err(e) = self.sink.export(vec![span]).await {
                                warn!("span export failed: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // TearingDown: readers first, then links and collections in
        // reverse, then the pin directory.
        transition(pid, &mut state, TargetState::TearingDown);
        let _ = reader_shutdown.send(());
        for task in reader_tasks {
            let _ = task.await;
        }
        while let Some(probe) = probes.pop() {
            probe.close();
        }
        if let Err(e) = std::fs::remove_dir_all(&pin_dir) {
            warn!("unable to remove {}: {e}", pin_dir.display());
        }
        transition(pid, &mut state, TargetState::Closed);
        Ok(())
    }

    fn pin_dir(&self) -> PathBuf {
        self.config.bpffs_root.join(self.pid.to_string())
    }
}
