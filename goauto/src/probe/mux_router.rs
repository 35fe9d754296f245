// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `github.com/gorilla/mux` router instrumentation. The router wraps the
//! standard request type, so the constants come out of the std catalog.

use opentelemetry::KeyValue;
use opentelemetry::trace::SpanKind;
use opentelemetry_semantic_conventions::trace::{HTTP_REQUEST_METHOD, URL_PATH};

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, ProbeManifest, UprobeSpec,
};
use crate::span::{SpanEvent, TracerId, null_terminated};

pub(crate) const PROBE_NAME: &str = "github.com/gorilla/mux/router";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/github.com/gorilla/mux";
const MUX_MODULE: &str = "github.com/gorilla/mux";

const METHOD_MAX: usize = 16;
const PATH_MAX: usize = 128;

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: MUX_MODULE,
        span_kind: SpanKind::Server,
        object_file: "mux_router.o",
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
                key: "ctx_ptr_pos",
                id: StructFieldId::new(STD_MODULE, "net/http", "Request", "ctx"),
            },
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
        ],
        uprobes: vec![UprobeSpec {
            symbol: "github.com/gorilla/mux.(*Router).ServeHTTP",
            entry_program: Some("uprobe_Router_ServeHTTP"),
            return_program: Some("uprobe_Router_ServeHTTP_Returns"),
            failure_mode: FailureMode::Warn,
            constraint: None,
        }],
        decode: DecodeMode::Struct,
        process: process_event,
    }
}

fn process_event(record: &[u8], ctx: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
    let mut cursor = EventCursor::new(PROBE_NAME, record);
    let base = cursor.base_span_properties()?;
    let method = null_terminated(&cursor.array::<METHOD_MAX>()?);
    let path = null_terminated(&cursor.array::<PATH_MAX>()?);

    Ok(Some(SpanEvent {
        name: method.clone(),
        kind: SpanKind::Server,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(true),
        status: opentelemetry::trace::Status::Unset,
        attributes: vec![
            KeyValue::new(HTTP_REQUEST_METHOD, method),
            KeyValue::new(URL_PATH, path),
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
    fn test_router_span() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_ne_bytes());
        buf.extend_from_slice(&2u64.to_ne_bytes());
        buf.extend_from_slice(&[5u8; 16]);
        buf.extend_from_slice(&[6u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&[0u8; 32]);
        let mut method = [0u8; METHOD_MAX];
        method[..6].copy_from_slice(b"DELETE");
        buf.extend_from_slice(&method);
        let mut path = [0u8; PATH_MAX];
        path[..9].copy_from_slice(b"/item/abc");
        buf.extend_from_slice(&path);

        let span = process_event(&buf, &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "DELETE");
        assert_eq!(attr(&span, "url.path"), Some(&Value::from("/item/abc")));
    }
}
