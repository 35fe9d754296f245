// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `google.golang.org/grpc` client-side (Invoke) instrumentation.

use opentelemetry::KeyValue;
use opentelemetry::trace::SpanKind;
use opentelemetry_semantic_conventions::trace::{RPC_SERVICE, RPC_SYSTEM};
use semver::Version;

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, PackageConstraint, ProbeManifest,
    UprobeSpec, version_req,
};
use crate::span::{SpanEvent, TracerId, null_terminated, split_host_port};

pub(crate) const PROBE_NAME: &str = "google.golang.org/grpc/client";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/google.golang.org/grpc";
pub(crate) const GRPC_MODULE: &str = "google.golang.org/grpc";

// Legacy peer attributes consumers of gRPC spans still key on; current
// semconv no longer defines them.
pub(crate) const NET_PEER_IP: &str = "net.peer.ip";
pub(crate) const NET_PEER_PORT: &str = "net.peer.port";

const METHOD_MAX: usize = 128;
const TARGET_MAX: usize = 256;

// Stream bookkeeping moved around this release.
const STREAM_MIN_VERSION: Version = Version::new(1, 40, 0);

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: GRPC_MODULE,
        span_kind: SpanKind::Client,
        object_file: "grpc_client.o",
        function_match: FunctionSetMatch::Any,
        consts: vec![
            Const::StructField {
                key: "clientconn_target_ptr_pos",
                id: StructFieldId::new(GRPC_MODULE, GRPC_MODULE, "ClientConn", "target"),
            },
            Const::StructFieldMinVersion {
                key: "httpclient_nextid_pos",
                id: StructFieldId::new(
                    GRPC_MODULE,
                    "google.golang.org/grpc/internal/transport",
                    "Stream",
                    "id",
                ),
                min_version: STREAM_MIN_VERSION,
            },
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
            // The traceparent header frame is staged in the remote arena.
            Const::Allocation,
            Const::RegistersAbi,
        ],
        uprobes: vec![UprobeSpec {
            symbol: "google.golang.org/grpc.(*ClientConn).Invoke",
            entry_program: Some("uprobe_ClientConn_Invoke"),
            return_program: Some("uprobe_ClientConn_Invoke_Returns"),
            failure_mode: FailureMode::Error,
            constraint: Some(PackageConstraint {
                req: version_req(">=1.14.0"),
                failure_mode: FailureMode::Warn,
            }),
        }],
        decode: DecodeMode::Struct,
        process: process_event,
    }
}

fn process_event(record: &[u8], ctx: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
    let mut cursor = EventCursor::new(PROBE_NAME, record);
    let base = cursor.base_span_properties()?;
    let method = null_terminated(&cursor.array::<METHOD_MAX>()?);
    let target = null_terminated(&cursor.array::<TARGET_MAX>()?);

    let mut attributes = vec![
        KeyValue::new(RPC_SYSTEM, "grpc"),
        KeyValue::new(RPC_SERVICE, method.clone()),
    ];
    let (peer_ip, peer_port) = split_host_port(&target);
    if !peer_ip.is_empty() {
        attributes.push(KeyValue::new(NET_PEER_IP, peer_ip));
    }
    if let Some(port) = peer_port {
        attributes.push(KeyValue::new(NET_PEER_PORT, port as i64));
    }

    Ok(Some(SpanEvent {
        name: method,
        kind: SpanKind::Client,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(true),
        status: opentelemetry::trace::Status::Unset,
        attributes,
        tracer: TracerId::new(TRACER_NAME, None),
        events: vec![],
        links: vec![],
    }))
}

#[cfg(test)]
mod test {
    use opentelemetry::Value;

    use super::*;
    use crate::probe::http_server::test::{attr, test_context};

    fn fixed<const N: usize>(value: &str) -> [u8; N] {
        let mut out = [0u8; N];
        out[..value.len()].copy_from_slice(value.as_bytes());
        out
    }

    fn record() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u64.to_ne_bytes());
        buf.extend_from_slice(&250u64.to_ne_bytes());
        // child: same trace id as the parent, its own span id
        let trace_id = [7u8; 16];
        buf.extend_from_slice(&trace_id);
        buf.extend_from_slice(&[2u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&trace_id);
        buf.extend_from_slice(&[1u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&fixed::<METHOD_MAX>("/pkg.Svc/Do"));
        buf.extend_from_slice(&fixed::<TARGET_MAX>("10.0.0.1:9000"));
        buf
    }

    #[test]
    fn test_client_span_with_parent() {
        let span = process_event(&record(), &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "/pkg.Svc/Do");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(attr(&span, "rpc.system"), Some(&Value::from("grpc")));
        assert_eq!(
            attr(&span, "rpc.service"),
            Some(&Value::from("/pkg.Svc/Do"))
        );
        assert_eq!(attr(&span, "net.peer.ip"), Some(&Value::from("10.0.0.1")));
        assert_eq!(attr(&span, "net.peer.port"), Some(&Value::from(9000i64)));

        let parent = span.parent.expect("parent present");
        assert!(parent.remote);
        assert_eq!(parent.context.trace_id, span.trace_id());
        assert_ne!(parent.context.span_id, span.context.span_id);
    }
}
