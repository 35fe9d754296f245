// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Span sinks. The event plane produces [`SpanEvent`] records; a sink
//! forwards them. The OTLP sink maps them onto SDK span data without
//! regenerating any id: what eBPF propagated over the wire is what gets
//! exported.

use async_trait::async_trait;
use log::{debug, info};
use opentelemetry::trace::SpanId;
use opentelemetry::{InstrumentationLibrary, KeyValue};
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::export::trace::{SpanData, SpanExporter as _};
use opentelemetry_sdk::trace::{SpanEvents, SpanLinks};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::errors::AutoError;
use crate::span::SpanEvent;

/// Default OTLP/gRPC collector endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[async_trait]
pub trait SpanSink: Send + Sync {
    async fn export(&self, spans: Vec<SpanEvent>) -> Result<(), AutoError>;

    async fn shutdown(&self) {}
}

/// Build the sink the configuration asks for.
pub fn new_sink(config: &Config) -> Result<Box<dyn SpanSink>, AutoError> {
    if config.stdout_sink {
        return Ok(Box::new(LogSink));
    }
    let endpoint = config
        .otlp_endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    Ok(Box::new(OtlpSink::new(
        &endpoint,
        config.service_name.as_deref(),
    )?))
}

/// Logs finished spans instead of exporting them.
pub struct LogSink;

#[async_trait]
impl SpanSink for LogSink {
    async fn export(&self, spans: Vec<SpanEvent>) -> Result<(), AutoError> {
        for span in spans {
            info!(
                "span {} kind={:?} traceparent={} attrs={}",
                span.name,
                span.kind,
                span.context.traceparent(),
                span.attributes.len()
            );
        }
        Ok(())
    }
}

pub struct OtlpSink {
    exporter: Mutex<opentelemetry_otlp::SpanExporter>,
    resource: Resource,
}

impl OtlpSink {
    pub fn new(endpoint: &str, service_name: Option<&str>) -> Result<Self, AutoError> {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| AutoError::ConfigError("otlp exporter".to_string(), e.to_string()))?;
        let resource = match service_name {
            Some(name) => Resource::new(vec![KeyValue::new(SERVICE_NAME, name.to_string())]),
            None => Resource::default(),
        };
        debug!("exporting spans to {endpoint}");
        Ok(Self {
            exporter: Mutex::new(exporter),
            resource,
        })
    }
}

#[async_trait]
impl SpanSink for OtlpSink {
    async fn export(&self, spans: Vec<SpanEvent>) -> Result<(), AutoError> {
        if spans.is_empty() {
            return Ok(());
        }
        let batch: Vec<SpanData> = spans
            .into_iter()
            .map(|span| to_span_data(span, self.resource.clone()))
            .collect();
        let mut exporter = self.exporter.lock().await;
        exporter
            .export(batch)
            .await
            .map_err(|e| AutoError::Error(format!("otlp export failed: {e}")))
    }

    async fn shutdown(&self) {
        let mut exporter = self.exporter.lock().await;
        exporter.shutdown();
    }
}

/// Map one span record onto SDK span data, ids preserved bit-exactly.
fn to_span_data(span: SpanEvent, resource: Resource) -> SpanData {
    let parent_span_id = span
        .parent
        .map(|p| SpanId::from_bytes(p.context.span_id))
        .unwrap_or(SpanId::INVALID);

    let mut events = SpanEvents::default();
    events.events = span.events;
    let mut links = SpanLinks::default();
    links.links = span.links;

    SpanData {
        span_context: span.context.to_otel(false),
        parent_span_id,
        span_kind: span.kind,
        name: span.name.into(),
        start_time: span.start_time,
        end_time: span.end_time,
        attributes: span.attributes,
        dropped_attributes_count: 0,
        events,
        links,
        status: span.status,
        instrumentation_lib: InstrumentationLibrary::new(
            span.tracer.name,
            span.tracer.version,
            span.tracer.schema_url,
            None,
        ),
        resource: std::borrow::Cow::Owned(resource),
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, UNIX_EPOCH};

    use opentelemetry::trace::{SpanKind, Status, TraceId};

    use super::*;
    use crate::span::{ParentContext, SpanContext, TracerId};

    fn sample_span(parent: Option<ParentContext>) -> SpanEvent {
        let mut trace_id = [0u8; 16];
        trace_id[0] = 1;
        SpanEvent {
            name: "GET".to_string(),
            kind: SpanKind::Server,
            start_time: UNIX_EPOCH + Duration::from_nanos(1000),
            end_time: UNIX_EPOCH + Duration::from_secs(2),
            context: SpanContext::new(trace_id, [2u8; 8], 1),
            parent,
            status: Status::Unset,
            attributes: vec![KeyValue::new("http.request.method", "GET")],
            tracer: TracerId::new("go.opentelemetry.io/auto/net/http", None),
            events: vec![],
            links: vec![],
        }
    }

    #[test]
    fn test_ids_pass_through() {
        let span = sample_span(None);
        let expected_trace = span.context.trace_id;
        let data = to_span_data(span, Resource::default());
        assert_eq!(
            data.span_context.trace_id(),
            TraceId::from_bytes(expected_trace)
        );
        assert_eq!(data.parent_span_id, SpanId::INVALID);
        assert_eq!(data.attributes.len(), 1);
        assert!(data.end_time >= data.start_time);
    }

    #[test]
    fn test_parent_id_mapping() {
        let mut trace_id = [0u8; 16];
        trace_id[0] = 1;
        let parent = ParentContext {
            context: SpanContext::new(trace_id, [9u8; 8], 1),
            remote: true,
        };
        let data = to_span_data(sample_span(Some(parent)), Resource::default());
        assert_eq!(data.parent_span_id, SpanId::from_bytes([9u8; 8]));
    }

    #[tokio::test]
    async fn test_log_sink() {
        let sink = LogSink;
        sink.export(vec![sample_span(None)]).await.expect("log sink never fails");
    }
}
