// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `google.golang.org/grpc` server-side (stream handling) instrumentation.

use opentelemetry::KeyValue;
use opentelemetry::trace::SpanKind;
use opentelemetry_semantic_conventions::trace::{RPC_SERVICE, RPC_SYSTEM};

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::grpc_client::GRPC_MODULE;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, PackageConstraint, ProbeManifest,
    UprobeSpec, version_req,
};
use crate::span::{SpanEvent, TracerId, null_terminated};

pub(crate) const PROBE_NAME: &str = "google.golang.org/grpc/server";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/google.golang.org/grpc";

const METHOD_MAX: usize = 128;

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: GRPC_MODULE,
        span_kind: SpanKind::Server,
        object_file: "grpc_server.o",
        function_match: FunctionSetMatch::Any,
        consts: vec![
            Const::StructField {
                key: "stream_method_ptr_pos",
                id: StructFieldId::new(
                    GRPC_MODULE,
                    "google.golang.org/grpc/internal/transport",
                    "Stream",
                    "method",
                ),
            },
            Const::StructField {
                key: "stream_id_pos",
                id: StructFieldId::new(
                    GRPC_MODULE,
                    "google.golang.org/grpc/internal/transport",
                    "Stream",
                    "id",
                ),
            },
            Const::StructField {
                key: "stream_ctx_pos",
                id: StructFieldId::new(
                    GRPC_MODULE,
                    "google.golang.org/grpc/internal/transport",
                    "Stream",
                    "ctx",
                ),
            },
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
            Const::RegistersAbi,
        ],
        uprobes: vec![UprobeSpec {
            symbol: "google.golang.org/grpc.(*Server).handleStream",
            entry_program: Some("uprobe_server_handleStream"),
            return_program: Some("uprobe_server_handleStream_Returns"),
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

    Ok(Some(SpanEvent {
        name: method.clone(),
        kind: SpanKind::Server,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(true),
        status: opentelemetry::trace::Status::Unset,
        attributes: vec![
            KeyValue::new(RPC_SYSTEM, "grpc"),
            KeyValue::new(RPC_SERVICE, method),
        ],
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

    #[test]
    fn test_server_span() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u64.to_ne_bytes());
        buf.extend_from_slice(&9u64.to_ne_bytes());
        buf.extend_from_slice(&[9u8; 16]);
        buf.extend_from_slice(&[8u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&[0u8; 32]);
        let mut method = [0u8; METHOD_MAX];
        method[..16].copy_from_slice(b"/echo.Echo/Unary");
        buf.extend_from_slice(&method);

        let span = process_event(&buf, &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "/echo.Echo/Unary");
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.parent, None);
        assert_eq!(attr(&span, "rpc.system"), Some(&Value::from("grpc")));
    }
}
