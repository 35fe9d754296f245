// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `net/http` server-side instrumentation.

use opentelemetry::KeyValue;
use opentelemetry::trace::SpanKind;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, NETWORK_PEER_ADDRESS,
    NETWORK_PEER_PORT, NETWORK_PROTOCOL_VERSION, SERVER_ADDRESS, SERVER_PORT, URL_PATH,
};
use semver::Version;

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, ProbeManifest, UprobeSpec,
};
use crate::span::{
    SpanEvent, TracerId, http_protocol_version, http_server_status, null_terminated,
    split_host_port,
};

pub(crate) const PROBE_NAME: &str = "net/http/server";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/net/http";

const METHOD_MAX: usize = 16;
const PATH_MAX: usize = 128;
const PATTERN_MAX: usize = 128;
const ADDR_MAX: usize = 256;
const PROTO_MAX: usize = 8;

// Request routing patterns only exist since this runtime release.
const PATTERN_MIN_VERSION: Version = Version::new(1, 22, 0);

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: STD_MODULE,
        span_kind: SpanKind::Server,
        object_file: "http_server.o",
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
                key: "remote_addr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "RemoteAddr"),
            },
            Const::StructField {
                key: "host_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "Host"),
            },
            Const::StructField {
                key: "proto_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "Proto"),
            },
            Const::StructField {
                key: "ctx_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "ctx"),
            },
            Const::StructFieldMinVersion {
                key: "req_pat_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "pat"),
                min_version: PATTERN_MIN_VERSION,
            },
            Const::StructFieldMinVersion {
                key: "pat_str_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "pattern", "str"),
                min_version: PATTERN_MIN_VERSION,
            },
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
        ],
        uprobes: vec![UprobeSpec {
            symbol: "net/http.serverHandler.ServeHTTP",
            entry_program: Some("uprobe_serverHandler_ServeHTTP"),
            return_program: Some("uprobe_serverHandler_ServeHTTP_Returns"),
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
    let pattern = null_terminated(&cursor.array::<PATTERN_MAX>()?);
    let remote_addr = null_terminated(&cursor.array::<ADDR_MAX>()?);
    let host = null_terminated(&cursor.array::<ADDR_MAX>()?);
    let proto = null_terminated(&cursor.array::<PROTO_MAX>()?);

    let mut attributes = vec![
        KeyValue::new(HTTP_REQUEST_METHOD, method.clone()),
        KeyValue::new(URL_PATH, path),
        KeyValue::new(HTTP_RESPONSE_STATUS_CODE, status_code),
    ];

    let (server_address, server_port) = split_host_port(&host);
    if !server_address.is_empty() {
        attributes.push(KeyValue::new(SERVER_ADDRESS, server_address));
    }
    if let Some(port) = server_port {
        attributes.push(KeyValue::new(SERVER_PORT, port as i64));
    }
    let (peer_address, peer_port) = split_host_port(&remote_addr);
    if !peer_address.is_empty() {
        attributes.push(KeyValue::new(NETWORK_PEER_ADDRESS, peer_address));
    }
    if let Some(port) = peer_port {
        attributes.push(KeyValue::new(NETWORK_PEER_PORT, port as i64));
    }
    if let Some(version) = http_protocol_version(&proto) {
        attributes.push(KeyValue::new(NETWORK_PROTOCOL_VERSION, version.to_string()));
    }

    // Patterned routes prefix the span name and carry http.route.
    let mut name = method.clone();
    if !pattern.is_empty() && ctx.go_version >= PATTERN_MIN_VERSION {
        let route = pattern
            .strip_prefix(&format!("{method} "))
            .unwrap_or(&pattern);
        name = format!("{method} {route}");
        attributes.push(KeyValue::new(HTTP_ROUTE, route.to_string()));
    }

    Ok(Some(SpanEvent {
        name,
        kind: SpanKind::Server,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(true),
        status: http_server_status(status_code),
        attributes,
        tracer: TracerId::new(TRACER_NAME, None),
        events: vec![],
        links: vec![],
    }))
}
