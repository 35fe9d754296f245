// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `net/http` client-side (transport round-trip) instrumentation.

use opentelemetry::KeyValue;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, SERVER_ADDRESS, SERVER_PORT, URL_FULL,
    URL_PATH,
};

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, ProbeManifest, UprobeSpec,
};
use crate::span::{SpanEvent, TracerId, null_terminated, split_host_port};

pub(crate) const PROBE_NAME: &str = "net/http/client";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/net/http";

const METHOD_MAX: usize = 16;
const PATH_MAX: usize = 128;
const HOST_MAX: usize = 256;
const SCHEME_MAX: usize = 8;

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: STD_MODULE,
        span_kind: SpanKind::Client,
        object_file: "http_client.o",
        function_match: FunctionSetMatch::Any,
        consts: vec![
            Const::StructField {
                key: "method_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "Method"),
            },
            Const::StructField {
                key: "url_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "URL"),
            },
            Const::StructField {
                key: "path_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/url", "URL", "Path"),
            },
            Const::StructField {
                key: "headers_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "Header"),
            },
            Const::StructField {
                key: "ctx_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "ctx"),
            },
            Const::StructField {
                key: "status_code_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Response", "StatusCode"),
            },
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
            // The traceparent header is written into the target's header
            // map out of the remote arena.
            Const::Allocation,
            Const::RegistersAbi,
        ],
        uprobes: vec![UprobeSpec {
            symbol: "net/http.(*Transport).roundTrip",
            entry_program: Some("uprobe_Transport_roundTrip"),
            return_program: Some("uprobe_Transport_roundTrip_Returns"),
            failure_mode: FailureMode::Error,
            constraint: None,
        }],
        decode: DecodeMode::Struct,
        process: process_event,
    }
}

fn process_event(record: &[u8], ctx: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
    let mut cursor = EventCursor::new(PROBE_NAME, record);
    let base = cursor.base_span_properties()?;
    let status_code = cursor.u64()? as i64;
    let method = null_terminated(&cursor.array::<METHOD_MAX>()?);
    let path = null_terminated(&cursor.array::<PATH_MAX>()?);
    let host = null_terminated(&cursor.array::<HOST_MAX>()?);
    let scheme = null_terminated(&cursor.array::<SCHEME_MAX>()?);

    let mut attributes = vec![
        KeyValue::new(HTTP_REQUEST_METHOD, method.clone()),
        KeyValue::new(URL_PATH, path.clone()),
        KeyValue::new(HTTP_RESPONSE_STATUS_CODE, status_code),
    ];
    let (server_address, server_port) = split_host_port(&host);
    if !server_address.is_empty() {
        attributes.push(KeyValue::new(SERVER_ADDRESS, server_address));
    }
    if let Some(port) = server_port {
        attributes.push(KeyValue::new(SERVER_PORT, port as i64));
    }
    if !scheme.is_empty() && !host.is_empty() {
        attributes.push(KeyValue::new(URL_FULL, format!("{scheme}://{host}{path}")));
    }

    // Client spans report Error on any 4xx/5xx response.
    let status = if (400..600).contains(&status_code) {
        Status::error("")
    } else {
        Status::Unset
    };

    Ok(Some(SpanEvent {
        name: method,
        kind: SpanKind::Client,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(false),
        status,
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

    fn record(status: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u64.to_ne_bytes());
        buf.extend_from_slice(&20u64.to_ne_bytes());
        let mut trace_id = [0u8; 16];
        trace_id[15] = 0xaa;
        buf.extend_from_slice(&trace_id);
        buf.extend_from_slice(&[3u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        // local parent with the same trace id
        buf.extend_from_slice(&trace_id);
        buf.extend_from_slice(&[4u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&status.to_ne_bytes());
        buf.extend_from_slice(&fixed::<METHOD_MAX>("POST"));
        buf.extend_from_slice(&fixed::<PATH_MAX>("/submit"));
        buf.extend_from_slice(&fixed::<HOST_MAX>("api.example.com:443"));
        buf.extend_from_slice(&fixed::<SCHEME_MAX>("https"));
        buf
    }

    #[test]
    fn test_client_span() {
        let span = process_event(&record(201), &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "POST");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(span.status, Status::Unset);
        let parent = span.parent.expect("local parent");
        assert!(!parent.remote);
        assert_eq!(parent.context.trace_id, span.trace_id());
        assert_eq!(
            attr(&span, "url.full"),
            Some(&Value::from("https://api.example.com:443/submit"))
        );
        assert_eq!(
            attr(&span, "server.address"),
            Some(&Value::from("api.example.com"))
        );
        assert_eq!(attr(&span, "server.port"), Some(&Value::from(443i64)));
    }

    #[test]
    fn test_client_error_status() {
        let span = process_event(&record(404), &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert!(matches!(span.status, Status::Error { .. }));
    }
}
