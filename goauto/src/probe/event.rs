// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Decoding of the fixed-layout records eBPF programs write to the perf
//! ring. Everything on the wire is host-endian and packed; strings are
//! fixed-size NUL-padded byte arrays.

use crate::errors::AutoError;
use crate::span::{ParentContext, SpanContext};

/// First byte of a discriminated record: telemetry payload follows.
pub const DISCRIMINATOR_TELEMETRY: u8 = 0;
/// First byte of a discriminated record: the probe should unload itself.
pub const DISCRIMINATOR_CONTROL: u8 = 1;

/// Wire size of a span context: 16-byte trace id, 8-byte span id, 1 flag
/// byte, 7 bytes padding.
pub const SPAN_CONTEXT_WIRE_SIZE: usize = 32;

/// Wire size of [`BaseSpanProperties`].
pub const BASE_SPAN_PROPERTIES_SIZE: usize = 16 + 2 * SPAN_CONTEXT_WIRE_SIZE;

/// The prefix shared by every telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseSpanProperties {
    pub start_time: u64,
    pub end_time: u64,
    pub span_context: SpanContext,
    pub parent_span_context: SpanContext,
}

impl BaseSpanProperties {
    /// The parent context, if the record carries one. `remote` marks
    /// parents that arrived over the wire.
    pub fn parent(&self, remote: bool) -> Option<ParentContext> {
        self.parent_span_context.is_valid().then_some(ParentContext {
            context: self.parent_span_context,
            remote,
        })
    }
}

/// Sequential reader over one raw perf record.
pub struct EventCursor<'a> {
    probe: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EventCursor<'a> {
    pub fn new(probe: &'static str, buf: &'a [u8]) -> Self {
        Self { probe, buf, pos: 0 }
    }

    fn short(&self, wanted: usize) -> AutoError {
        AutoError::DecodeFailed {
            probe: self.probe.to_string(),
            reason: format!(
                "record too short: wanted {wanted} more bytes at offset {} of {}",
                self.pos,
                self.buf.len()
            ),
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], AutoError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(self.short(n));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), AutoError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, AutoError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, AutoError> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, AutoError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, AutoError> {
        let b = self.take(8)?;
        Ok(u64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], AutoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn span_context(&mut self) -> Result<SpanContext, AutoError> {
        let trace_id = self.array::<16>()?;
        let span_id = self.array::<8>()?;
        let flags = self.u8()?;
        self.skip(7)?; // padding
        Ok(SpanContext::new(trace_id, span_id, flags))
    }

    pub fn base_span_properties(&mut self) -> Result<BaseSpanProperties, AutoError> {
        Ok(BaseSpanProperties {
            start_time: self.u64()?,
            end_time: self.u64()?,
            span_context: self.span_context()?,
            parent_span_context: self.span_context()?,
        })
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Split a discriminated record into its kind and payload. Telemetry
/// payloads are size-prefixed; the size is validated against the record.
pub enum DiscriminatedRecord<'a> {
    Telemetry(&'a [u8]),
    Control,
}

pub fn read_discriminated<'a>(
    probe: &'static str,
    buf: &'a [u8],
) -> Result<DiscriminatedRecord<'a>, AutoError> {
    let mut cursor = EventCursor::new(probe, buf);
    match cursor.u8()? {
        DISCRIMINATOR_CONTROL => Ok(DiscriminatedRecord::Control),
        DISCRIMINATOR_TELEMETRY => {
            cursor.skip(3)?; // alignment padding before the size field
            let size = cursor.u32()? as usize;
            let payload = cursor.take(size.min(cursor.remaining()))?;
            Ok(DiscriminatedRecord::Telemetry(payload))
        }
        other => Err(AutoError::DecodeFailed {
            probe: probe.to_string(),
            reason: format!("unknown record discriminator {other}"),
        }),
    }
}
