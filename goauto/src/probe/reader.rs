// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Per-probe perf ring readers: one task per CPU buffer, all funneling
//! decoded span events into the target's dispatch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use aya::maps::Map;
use aya::maps::perf::AsyncPerfEventArray;
use bytes::BytesMut;
use log::{debug, error, warn};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::errors::AutoError;
use crate::probe::event::{DiscriminatedRecord, read_discriminated};
use crate::probe::{DecodeMode, EventContext, ProcessFn};
use crate::span::SpanEvent;
use crate::utils::online_cpu_ids;

/// Default perf ring size, in pages.
pub const DEFAULT_RING_PAGES: usize = 128;

// Per-task scratch buffers handed to the kernel on every read.
const READ_BATCH: usize = 16;
const RECORD_CAPACITY: usize = 4096;

/// What one raw record turned into.
enum Decoded {
    Span(SpanEvent),
    /// The probe was asked to unload itself.
    Control,
    Skip,
}

/// Open one perf buffer per online CPU and spawn the blocking read loops.
/// Dropping the shutdown sender (or sending on it) closes every reader,
/// which is the only cancellation mechanism a reader has or needs.
#[allow(clippy::too_many_arguments)]
pub fn spawn_readers(
    probe_name: &'static str,
    events_map: Map,
    decode: DecodeMode,
    process: ProcessFn,
    ctx: EventContext,
    spans: mpsc::Sender<SpanEvent>,
    unload: mpsc::Sender<&'static str>,
    dropped: Arc<AtomicU64>,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>, AutoError> {
    let mut array: AsyncPerfEventArray<_> = AsyncPerfEventArray::try_from(events_map)?;

    let cpus = online_cpu_ids()?;
    let mut tasks = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let mut ring = array.open(cpu, Some(DEFAULT_RING_PAGES))?;
        let ctx = ctx.clone();
        let spans = spans.clone();
        let unload = unload.clone();
        let dropped = dropped.clone();
        let mut shutdown = shutdown.subscribe();

        tasks.push(tokio::spawn(async move {
            let mut buffers: Vec<BytesMut> = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(RECORD_CAPACITY))
                .collect();
            loop {
                select! {
                    biased;
                    _ = shutdown.recv() => {
                        // Reader closed; exit quietly.
                        debug!("reader for {probe_name} cpu {cpu} closed");
                        return;
                    }
                    events = ring.read_events(&mut buffers) => {
                        let events = match events {
                            Ok(events) => events,
                            Err(e) => {
                                error!("perf read on {probe_name} cpu {cpu} failed: {e}");
                                return;
                            }
                        };
                        if events.lost > 0 {
                            dropped.fetch_add(events.lost as u64, Ordering::Relaxed);
                            warn!("{probe_name} lost {} samples on cpu {cpu}", events.lost);
                        }
                        for buf in buffers.iter().take(events.read) {
                            match decode_record(probe_name, decode, process, &ctx, buf) {
                                Decoded::Span(span) => {
                                    if spans.send(span).await.is_err() {
                                        return;
                                    }
                                }
                                Decoded::Control => {
                                    let _ = unload.send(probe_name).await;
                                    return;
                                }
                                Decoded::Skip => {}
                            }
                        }
                    }
                }
            }
        }));
    }
    Ok(tasks)
}

/// Decode one record. Failures drop the record: a corrupt sample must not
/// take the reader down.
fn decode_record(
    probe_name: &'static str,
    decode: DecodeMode,
    process: ProcessFn,
    ctx: &EventContext,
    buf: &[u8],
) -> Decoded {
    let result = match decode {
        DecodeMode::Struct => process(buf, ctx),
        DecodeMode::Discriminated => match read_discriminated(probe_name, buf) {
            Ok(DiscriminatedRecord::Control) => return Decoded::Control,
            Ok(DiscriminatedRecord::Telemetry(payload)) => process(payload, ctx),
            Err(e) => Err(e),
        },
    };
    match result {
        Ok(Some(span)) => Decoded::Span(span),
        Ok(None) => Decoded::Skip,
        Err(e) => {
            warn!("dropping record from {probe_name}: {e} ({} bytes)", buf.len());
            Decoded::Skip
        }
    }
}

#[cfg(test)]
mod test {
    use semver::Version;

    use super::*;
    use crate::probe::event::{DISCRIMINATOR_CONTROL, DISCRIMINATOR_TELEMETRY};
    use crate::span::BootClock;

    fn ctx() -> EventContext {
        EventContext {
            clock: BootClock::with_offset(0),
            go_version: Version::new(1, 22, 0),
        }
    }

    fn nop_process(_: &[u8], _: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
        Ok(None)
    }

    fn failing_process(_: &[u8], _: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
        Err(AutoError::DecodeFailed {
            probe: "test".to_string(),
            reason: "nope".to_string(),
        })
    }

    #[test]
    fn test_control_record_requests_unload() {
        let buf = [DISCRIMINATOR_CONTROL, 0, 0, 0];
        assert!(matches!(
            decode_record("test", DecodeMode::Discriminated, nop_process, &ctx(), &buf),
            Decoded::Control
        ));
    }

    #[test]
    fn test_telemetry_record_reaches_process_fn() {
        fn check(payload: &[u8], _: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
            assert_eq!(payload, b"xy");
            Ok(None)
        }
        let mut buf = vec![DISCRIMINATOR_TELEMETRY, 0, 0, 0];
        buf.extend_from_slice(&2u32.to_ne_bytes());
        buf.extend_from_slice(b"xyZZZ");
        assert!(matches!(
            decode_record("test", DecodeMode::Discriminated, check, &ctx(), &buf),
            Decoded::Skip
        ));
    }

    #[test]
    fn test_decode_failure_drops_record() {
        assert!(matches!(
            decode_record("test", DecodeMode::Struct, failing_process, &ctx(), &[1, 2, 3]),
            Decoded::Skip
        ));
    }
}
