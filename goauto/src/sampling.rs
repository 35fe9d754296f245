// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! The user-space half of the sampling and propagation plane: shared map
//! names (part of the eBPF contract) and the fraction-to-numerator
//! conversion written into each probe's config map.

use aya::Ebpf;
use aya::maps::Array;
use log::debug;

use crate::config::Sampler;
use crate::errors::AutoError;

/// In-flight spans keyed by span context. Written by `start_tracking_span`
/// in eBPF, consulted by peer probes for parent lookup, cleared by
/// `stop_tracking_span`.
pub const TRACKED_SPANS_MAP: &str = "tracked_spans_by_sc";

/// Current span context keyed by the address of the goroutine's
/// request-scoped context object; lets a downstream probe recover the
/// parent established upstream on the same goroutine.
pub const GO_CONTEXT_MAP: &str = "go_context_to_sc";

/// Per-probe configuration consumed by eBPF on the fast path.
pub const PROBE_CONFIG_MAP: &str = "probe_config";

/// Default sampling denominator.
pub const DEFAULT_DENOMINATOR: u64 = 1 << 32;

// Largest |n/D - f| still considered an exact representation.
const TOLERANCE: f64 = 1e-9;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    pub numerator: u64,
    pub denominator: u64,
}

// SamplingConfig is two unpadded u64s, safe to hand to the kernel as
// plain bytes.
unsafe impl aya::Pod for SamplingConfig {}

/// Integer numerator for `fraction` against `denominator`.
pub fn numerator_for(fraction: f64, denominator: u64) -> Result<u64, AutoError> {
    if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
        return Err(AutoError::InvalidFraction(fraction));
    }
    let exact = fraction * denominator as f64;
    let rounded = exact.round();
    if (rounded / denominator as f64 - fraction).abs() > TOLERANCE {
        return Err(AutoError::PrecisionLoss(fraction));
    }
    Ok(rounded as u64)
}

/// The kernel-side configuration for one sampler choice.
pub fn config_for(sampler: &Sampler) -> Result<SamplingConfig, AutoError> {
    let numerator = match sampler {
        Sampler::AlwaysOn => DEFAULT_DENOMINATOR,
        Sampler::AlwaysOff => 0,
        Sampler::TraceIdRatio(fraction) => numerator_for(*fraction, DEFAULT_DENOMINATOR)?,
    };
    Ok(SamplingConfig {
        numerator,
        denominator: DEFAULT_DENOMINATOR,
    })
}

/// Write the sampling configuration into a loaded probe. Probes without a
/// config map do not sample and are skipped.
pub fn apply(ebpf: &mut Ebpf, config: SamplingConfig) -> Result<(), AutoError> {
    let Some(map) = ebpf.map_mut(PROBE_CONFIG_MAP) else {
        debug!("probe exposes no {PROBE_CONFIG_MAP} map, skipping sampling config");
        return Ok(());
    };
    let mut array: Array<_, SamplingConfig> = Array::try_from(map)?;
    array.set(0, config, 0)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_exact_fractions() {
        assert_eq!(
            numerator_for(0.5, DEFAULT_DENOMINATOR).unwrap(),
            DEFAULT_DENOMINATOR / 2
        );
        assert_eq!(
            numerator_for(0.25, DEFAULT_DENOMINATOR).unwrap(),
            DEFAULT_DENOMINATOR / 4
        );
        assert_eq!(numerator_for(0.0, DEFAULT_DENOMINATOR).unwrap(), 0);
        assert_eq!(
            numerator_for(1.0, DEFAULT_DENOMINATOR).unwrap(),
            DEFAULT_DENOMINATOR
        );
    }

    #[test]
    fn test_near_fraction_within_tolerance() {
        // 0.1 is not a dyadic rational, but with a 2^32 denominator the
        // rounding error is far below the tolerance.
        let numerator = numerator_for(0.1, DEFAULT_DENOMINATOR).unwrap();
        let reconstructed = numerator as f64 / DEFAULT_DENOMINATOR as f64;
        assert!((reconstructed - 0.1).abs() <= TOLERANCE);
    }

    #[test]
    fn test_precision_loss() {
        assert_matches!(
            numerator_for(1.0 / 3.0, 100),
            Err(AutoError::PrecisionLoss(_))
        );
    }

    #[test]
    fn test_invalid_fractions() {
        for fraction in [-0.25, 1.5, f64::NAN, f64::INFINITY] {
            assert_matches!(
                numerator_for(fraction, DEFAULT_DENOMINATOR),
                Err(AutoError::InvalidFraction(_))
            );
        }
    }

    #[test]
    fn test_sampler_configs() {
        assert_eq!(
            config_for(&Sampler::AlwaysOn).unwrap().numerator,
            DEFAULT_DENOMINATOR
        );
        assert_eq!(config_for(&Sampler::AlwaysOff).unwrap().numerator, 0);
        let ratio = config_for(&Sampler::TraceIdRatio(0.5)).unwrap();
        assert_eq!(ratio.numerator, DEFAULT_DENOMINATOR / 2);
        assert_eq!(ratio.denominator, DEFAULT_DENOMINATOR);
    }
}
