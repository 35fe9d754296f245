// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! The abstract span record handed to the configured sink, plus the helpers
//! shared by every probe's event processing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::time::{ClockId, clock_gettime};
use opentelemetry::trace::{Event, Link, SpanKind, Status, TraceFlags, TraceState};
use opentelemetry::{KeyValue, trace};

/// The `(trace id, span id, flags)` triple carried on the wire by every
/// telemetry record. Valid iff the trace id is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub trace_flags: u8,
}

impl SpanContext {
    pub fn new(trace_id: [u8; 16], span_id: [u8; 8], trace_flags: u8) -> Self {
        Self {
            trace_id,
            span_id,
            trace_flags,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id != [0u8; 16]
    }

    /// The W3C `traceparent` header value, always exactly 55 bytes:
    /// `00-<32 hex>-<16 hex>-<2 hex>`.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            hex::encode(self.trace_id),
            hex::encode(self.span_id),
            self.trace_flags
        )
    }

    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        if parts.next()? != "00" {
            return None;
        }
        let trace_id: [u8; 16] = hex::decode(parts.next()?).ok()?.try_into().ok()?;
        let span_id: [u8; 8] = hex::decode(parts.next()?).ok()?.try_into().ok()?;
        let flags = u8::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        let sc = Self::new(trace_id, span_id, flags);
        sc.is_valid().then_some(sc)
    }

    /// Convert into the SDK representation, preserving the ids bit-exactly.
    pub fn to_otel(&self, remote: bool) -> trace::SpanContext {
        trace::SpanContext::new(
            trace::TraceId::from_bytes(self.trace_id),
            trace::SpanId::from_bytes(self.span_id),
            TraceFlags::new(self.trace_flags),
            remote,
            TraceState::default(),
        )
    }
}

/// A span's parent. `remote` is set by probes whose parent context arrived
/// over the wire (server side of a propagated trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentContext {
    pub context: SpanContext,
    pub remote: bool,
}

/// Identity of the tracer a span is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerId {
    pub name: String,
    pub version: Option<String>,
    pub schema_url: Option<String>,
}

impl TracerId {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
            schema_url: Some(opentelemetry_semantic_conventions::SCHEMA_URL.to_string()),
        }
    }
}

/// One finished span, ready for export. Ids are the ids the eBPF side
/// propagated; the sink must not regenerate them.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub context: SpanContext,
    pub parent: Option<ParentContext>,
    pub status: Status,
    pub attributes: Vec<KeyValue>,
    pub tracer: TracerId,
    pub events: Vec<Event>,
    pub links: Vec<Link>,
}

impl SpanEvent {
    pub fn trace_id(&self) -> [u8; 16] {
        self.context.trace_id
    }
}

/// Translates kernel-monotonic timestamps (`bpf_ktime_get_ns`) to wall
/// clock. The offset is sampled once per manager; drift over a process
/// lifetime is well below span-duration noise.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    offset_ns: i128,
}

impl BootClock {
    pub fn new() -> Self {
        let real = clock_gettime(ClockId::CLOCK_REALTIME)
            .map(|t| t.tv_sec() as i128 * 1_000_000_000 + t.tv_nsec() as i128)
            .unwrap_or(0);
        let mono = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map(|t| t.tv_sec() as i128 * 1_000_000_000 + t.tv_nsec() as i128)
            .unwrap_or(0);
        Self {
            offset_ns: real - mono,
        }
    }

    /// A clock with a fixed monotonic-to-wall offset.
    pub fn with_offset(offset_ns: i128) -> Self {
        Self { offset_ns }
    }

    pub fn to_wall(&self, monotonic_ns: u64) -> SystemTime {
        let ns = monotonic_ns as i128 + self.offset_ns;
        if ns <= 0 {
            return UNIX_EPOCH;
        }
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a fixed-size NUL-padded byte array to a string, truncating at
/// the first NUL byte.
pub fn null_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Split a `host:port` pair. The port is dropped when absent or invalid.
pub fn split_host_port(value: &str) -> (String, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (value.to_string(), None),
        },
        None => (value.to_string(), None),
    }
}

/// `"HTTP/1.1"` -> `"1.1"`.
pub fn http_protocol_version(proto: &str) -> Option<&str> {
    proto.strip_prefix("HTTP/").filter(|v| !v.is_empty())
}

/// Server spans report Error only for 5xx responses.
pub fn http_server_status(code: i64) -> Status {
    if (500..600).contains(&code) {
        Status::error("")
    } else {
        Status::Unset
    }
}
