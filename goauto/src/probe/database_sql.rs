// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! `database/sql` driver-level instrumentation.

use opentelemetry::KeyValue;
use opentelemetry::trace::SpanKind;
use opentelemetry_semantic_conventions::trace::DB_STATEMENT;

use crate::errors::AutoError;
use crate::inject::{Const, ConstValue};
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::event::EventCursor;
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, ProbeManifest, UprobeSpec,
};
use crate::span::{SpanEvent, TracerId, null_terminated};

pub(crate) const PROBE_NAME: &str = "database/sql";
const TRACER_NAME: &str = "go.opentelemetry.io/auto/database/sql";

const QUERY_MAX: usize = 256;

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: STD_MODULE,
        span_kind: SpanKind::Client,
        object_file: "database_sql.o",
        function_match: FunctionSetMatch::Any,
        consts: vec![
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
            Const::KeyVal {
                key: "should_include_db_statement",
                value: ConstValue::Bool(true),
            },
            Const::RegistersAbi,
        ],
        uprobes: vec![
            UprobeSpec {
                symbol: "database/sql.(*DB).queryDC",
                entry_program: Some("uprobe_queryDC"),
                return_program: Some("uprobe_queryDC_Returns"),
                failure_mode: FailureMode::Warn,
                constraint: None,
            },
            UprobeSpec {
                symbol: "database/sql.(*DB).execDC",
                entry_program: Some("uprobe_execDC"),
                return_program: Some("uprobe_execDC_Returns"),
                failure_mode: FailureMode::Warn,
                constraint: None,
            },
        ],
        decode: DecodeMode::Struct,
        process: process_event,
    }
}

fn process_event(record: &[u8], ctx: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
    let mut cursor = EventCursor::new(PROBE_NAME, record);
    let base = cursor.base_span_properties()?;
    let query = null_terminated(&cursor.array::<QUERY_MAX>()?);

    // First keyword of the statement, the usual low-cardinality span name.
    let name = query
        .split_whitespace()
        .next()
        .map(str::to_uppercase)
        .unwrap_or_else(|| "DB".to_string());

    Ok(Some(SpanEvent {
        name,
        kind: SpanKind::Client,
        start_time: ctx.clock.to_wall(base.start_time),
        end_time: ctx.clock.to_wall(base.end_time),
        context: base.span_context,
        parent: base.parent(false),
        status: opentelemetry::trace::Status::Unset,
        attributes: vec![KeyValue::new(DB_STATEMENT, query)],
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
    fn test_query_span() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_ne_bytes());
        buf.extend_from_slice(&2u64.to_ne_bytes());
        buf.extend_from_slice(&[1u8; 16]);
        buf.extend_from_slice(&[2u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&[0u8; 32]);
        let mut query = [0u8; QUERY_MAX];
        let text = b"select id from users where id = ?";
        query[..text.len()].copy_from_slice(text);
        buf.extend_from_slice(&query);

        let span = process_event(&buf, &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "SELECT");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(
            attr(&span, "db.statement"),
            Some(&Value::from("select id from users where id = ?"))
        );
    }

    #[test]
    fn test_empty_query() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_ne_bytes());
        buf.extend_from_slice(&2u64.to_ne_bytes());
        buf.extend_from_slice(&[1u8; 16]);
        buf.extend_from_slice(&[2u8; 8]);
        buf.push(1);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&[0u8; 32]);
        buf.extend_from_slice(&[0u8; QUERY_MAX]);

        let span = process_event(&buf, &test_context())
            .expect("record decodes")
            .expect("span produced");
        assert_eq!(span.name, "DB");
    }
}
