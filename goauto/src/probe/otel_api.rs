// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Instrumentation of the manual tracer API: spans started through
//! `go.opentelemetry.io/otel` against the no-op global provider are
//! intercepted, serialized by the eBPF side as a protobuf trace envelope,
//! and re-emitted as recorded spans.

use log::warn;
use opentelemetry::trace::{Event, Link, SpanKind, Status};
use opentelemetry::{KeyValue, Value};
use opentelemetry_proto::tonic::common::v1::any_value::Value as ProtoValue;
use opentelemetry_proto::tonic::common::v1::KeyValue as ProtoKeyValue;
use opentelemetry_proto::tonic::trace::v1::TracesData;
use prost::Message as _;

use crate::errors::AutoError;
use crate::inject::Const;
use crate::offsets::{STD_MODULE, StructFieldId};
use crate::probe::{
    DecodeMode, EventContext, FailureMode, FunctionSetMatch, ProbeManifest, UprobeSpec,
};
use crate::span::{ParentContext, SpanContext, SpanEvent, TracerId};

pub(crate) const PROBE_NAME: &str = "go.opentelemetry.io/otel/traceglobal";
const OTEL_MODULE: &str = "go.opentelemetry.io/otel";
const DEFAULT_TRACER_NAME: &str = "go.opentelemetry.io/auto/go.opentelemetry.io/otel";

pub fn manifest() -> ProbeManifest {
    ProbeManifest {
        name: PROBE_NAME,
        package: OTEL_MODULE,
        span_kind: SpanKind::Client,
        object_file: "otel_global.o",
        function_match: FunctionSetMatch::All,
        consts: vec![
            Const::StructField {
                key: "goid_pos",
                id: StructFieldId::new(STD_MODULE, "runtime", "g", "goid"),
            },
            // Serialized span envelopes are staged in the remote arena.
            Const::Allocation,
            Const::RegistersAbi,
        ],
        uprobes: vec![
            UprobeSpec {
                symbol: "go.opentelemetry.io/otel/internal/global.(*tracer).Start",
                entry_program: Some("uprobe_Start"),
                return_program: Some("uprobe_Start_Returns"),
                failure_mode: FailureMode::Error,
                constraint: None,
            },
            UprobeSpec {
                symbol: "go.opentelemetry.io/otel/internal/global.(*nonRecordingSpan).End",
                entry_program: Some("uprobe_End"),
                return_program: None,
                failure_mode: FailureMode::Error,
                constraint: None,
            },
            UprobeSpec {
                symbol: "go.opentelemetry.io/otel/internal/global.(*nonRecordingSpan).SetAttributes",
                entry_program: Some("uprobe_SetAttributes"),
                return_program: None,
                failure_mode: FailureMode::Warn,
                constraint: None,
            },
            UprobeSpec {
                symbol: "go.opentelemetry.io/otel/internal/global.(*nonRecordingSpan).SetStatus",
                entry_program: Some("uprobe_SetStatus"),
                return_program: None,
                failure_mode: FailureMode::Warn,
                constraint: None,
            },
            UprobeSpec {
                symbol: "go.opentelemetry.io/otel/internal/global.(*nonRecordingSpan).SetName",
                entry_program: Some("uprobe_SetName"),
                return_program: None,
                failure_mode: FailureMode::Warn,
                constraint: None,
            },
        ],
        decode: DecodeMode::Discriminated,
        process: process_event,
    }
}

fn decode_failed(reason: impl Into<String>) -> AutoError {
    AutoError::DecodeFailed {
        probe: PROBE_NAME.to_string(),
        reason: reason.into(),
    }
}

/// `payload` is the size-prefixed body already extracted by the reader: a
/// protobuf `TracesData` envelope carrying exactly one span.
fn process_event(payload: &[u8], ctx: &EventContext) -> Result<Option<SpanEvent>, AutoError> {
    let data = TracesData::decode(payload).map_err(|e| decode_failed(e.to_string()))?;

    // An envelope with no spans is dropped, not a hard failure: eBPF only
    // emits fully-populated envelopes, so an empty one means truncation.
    let Some(resource_spans) = data.resource_spans.first() else {
        warn!("span envelope without resource spans");
        return Ok(None);
    };
    let Some(scope_spans) = resource_spans.scope_spans.first() else {
        warn!("span envelope without scope spans");
        return Ok(None);
    };
    let Some(span) = scope_spans.spans.first() else {
        warn!("span envelope without spans");
        return Ok(None);
    };

    let trace_id: [u8; 16] = span
        .trace_id
        .as_slice()
        .try_into()
        .map_err(|_| decode_failed("trace id is not 16 bytes"))?;
    let span_id: [u8; 8] = span
        .span_id
        .as_slice()
        .try_into()
        .map_err(|_| decode_failed("span id is not 8 bytes"))?;
    let context = SpanContext::new(trace_id, span_id, 1);

    let parent = <[u8; 8]>::try_from(span.parent_span_id.as_slice())
        .ok()
        .filter(|id| *id != [0u8; 8])
        .map(|parent_span_id| ParentContext {
            context: SpanContext::new(trace_id, parent_span_id, 1),
            remote: false,
        });

    let attributes = convert_attributes(&span.attributes);

    let status = match span.status.as_ref() {
        Some(status) if status.code == 2 => Status::error(status.message.clone()),
        Some(status) if status.code == 1 => Status::Ok,
        _ => Status::Unset,
    };

    let events = span
        .events
        .iter()
        .map(|event| {
            Event::new(
                event.name.clone(),
                ctx.clock.to_wall(event.time_unix_nano),
                convert_attributes(&event.attributes),
                event.dropped_attributes_count,
            )
        })
        .collect();

    let links = span
        .links
        .iter()
        .filter_map(|link| {
            let trace_id: [u8; 16] = link.trace_id.as_slice().try_into().ok()?;
            let span_id: [u8; 8] = link.span_id.as_slice().try_into().ok()?;
            Some(Link::new(
                SpanContext::new(trace_id, span_id, 1).to_otel(false),
                convert_attributes(&link.attributes),
            ))
        })
        .collect();

    let tracer = match scope_spans.scope.as_ref() {
        Some(scope) if !scope.name.is_empty() => TracerId::new(
            scope.name.clone(),
            (!scope.version.is_empty()).then(|| scope.version.clone()),
        ),
        _ => TracerId::new(DEFAULT_TRACER_NAME, None),
    };

    Ok(Some(SpanEvent {
        name: span.name.clone(),
        kind: convert_kind(span.kind),
        start_time: ctx.clock.to_wall(span.start_time_unix_nano),
        end_time: ctx.clock.to_wall(span.end_time_unix_nano),
        context,
        parent,
        status,
        attributes,
        tracer,
        events,
        links,
    }))
}

fn convert_kind(kind: i32) -> SpanKind {
    match kind {
        2 => SpanKind::Server,
        3 => SpanKind::Client,
        4 => SpanKind::Producer,
        5 => SpanKind::Consumer,
        _ => SpanKind::Internal,
    }
}

/// Order-preserving attribute conversion. Composite values the manual API
/// can produce but the wire probes never emit are skipped.
fn convert_attributes(attributes: &[ProtoKeyValue]) -> Vec<KeyValue> {
    attributes
        .iter()
        .filter_map(|kv| {
            let value = convert_value(kv.value.as_ref()?.value.as_ref()?)?;
            Some(KeyValue::new(kv.key.clone(), value))
        })
        .collect()
}

fn convert_value(value: &ProtoValue) -> Option<Value> {
    match value {
        ProtoValue::StringValue(s) => Some(Value::from(s.clone())),
        ProtoValue::BoolValue(b) => Some(Value::Bool(*b)),
        ProtoValue::IntValue(i) => Some(Value::I64(*i)),
        ProtoValue::DoubleValue(d) => Some(Value::F64(*d)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use opentelemetry_proto::tonic::common::v1::AnyValue;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, TracesData};

    use super::*;
    use crate::probe::http_server::test::test_context;

    fn proto_attr(key: &str, value: ProtoValue) -> ProtoKeyValue {
        ProtoKeyValue {
            key: key.to_string(),
            value: Some(AnyValue { value: Some(value) }),
        }
    }

    fn envelope(span: Span) -> Vec<u8> {
        TracesData {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![span],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
        .encode_to_vec()
    }

    #[test]
    fn test_user_span_attributes_in_order() {
        let span = Span {
            trace_id: vec![0xab; 16],
            span_id: vec![0xcd; 8],
            name: "Foo".to_string(),
            kind: 3, // client
            start_time_unix_nano: 100,
            end_time_unix_nano: 300,
            attributes: vec![
                proto_attr("bool_key", ProtoValue::BoolValue(true)),
                proto_attr(
                    "string_key1",
                    ProtoValue::StringValue("string value 1".to_string()),
                ),
                proto_attr("float_key", ProtoValue::DoubleValue(std::f64::consts::PI)),
                proto_attr("int_key", ProtoValue::IntValue(42)),
                proto_attr(
                    "string_key2",
                    ProtoValue::StringValue("string value 2".to_string()),
                ),
            ],
            ..Default::default()
        };

        let event = process_event(&envelope(span), &test_context())
            .expect("envelope decodes")
            .expect("span produced");

        assert_eq!(event.name, "Foo");
        assert_eq!(event.kind, SpanKind::Client);
        assert_eq!(event.trace_id(), [0xab; 16]);
        assert_eq!(event.parent, None);

        let got: Vec<(&str, Value)> = event
            .attributes
            .iter()
            .map(|kv| (kv.key.as_str(), kv.value.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("bool_key", Value::Bool(true)),
                ("string_key1", Value::from("string value 1")),
                ("float_key", Value::F64(std::f64::consts::PI)),
                ("int_key", Value::I64(42)),
                ("string_key2", Value::from("string value 2")),
            ]
        );
    }

    #[test]
    fn test_parent_span_id() {
        let span = Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            parent_span_id: vec![3; 8],
            name: "child".to_string(),
            kind: 1,
            ..Default::default()
        };
        let event = process_event(&envelope(span), &test_context())
            .expect("envelope decodes")
            .expect("span produced");
        let parent = event.parent.expect("parent present");
        assert!(!parent.remote);
        assert_eq!(parent.context.trace_id, [1; 16]);
        assert_eq!(parent.context.span_id, [3; 8]);
    }

    #[test]
    fn test_error_status() {
        let span = Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: "failing".to_string(),
            status: Some(opentelemetry_proto::tonic::trace::v1::Status {
                message: "boom".to_string(),
                code: 2,
            }),
            ..Default::default()
        };
        let event = process_event(&envelope(span), &test_context())
            .expect("envelope decodes")
            .expect("span produced");
        assert!(matches!(event.status, Status::Error { .. }));
    }

    #[test]
    fn test_empty_envelope_dropped() {
        let empty = TracesData {
            resource_spans: vec![],
        }
        .encode_to_vec();
        assert!(process_event(&empty, &test_context())
            .expect("decodes")
            .is_none());
    }

    #[test]
    fn test_garbage_payload() {
        assert!(process_event(&[0xff, 0xff, 0xff, 0x01], &test_context()).is_err());
    }
}
