use std::fmt;

use crate::generation::Generation;
use crate::pulse::{Pulse, PulseUnit};

/// Composite identifier for one aggregated counter in the KV store.
///
/// Printed as `generation:{G}:tenant:{T}:sku:{S}:useUnit:{U}`. Splitting the
/// printed form on `:` yields exactly eight tokens, none empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterKey {
    pub generation: Generation,
    pub tenant_id: String,
    pub product_sku: String,
    pub use_unit: PulseUnit,
}

/// Why a scanned key could not be decoded back into a counter identity.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("expected 8 ':'-separated tokens, got {0}")]
    TokenCount(usize),
    #[error("one or more tokens are empty")]
    EmptyToken,
    #[error("unexpected marker {found:?}, expected {expected:?}")]
    BadMarker {
        expected: &'static str,
        found: String,
    },
    #[error("unrecognized generation label: {0}")]
    BadGeneration(String),
    #[error("unrecognized unit: {0}")]
    BadUnit(String),
}

impl CounterKey {
    /// Identity of the counter a pulse folds into under `generation`.
    pub fn for_pulse(generation: Generation, pulse: &Pulse) -> Self {
        Self {
            generation,
            tenant_id: pulse.tenant_id.clone(),
            product_sku: pulse.product_sku.clone(),
            use_unit: pulse.use_unit,
        }
    }

    /// Decodes a stored key, validating shape, markers, and unit.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() != 8 {
            return Err(KeyError::TokenCount(parts.len()));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(KeyError::EmptyToken);
        }

        for (index, expected) in [(0, "generation"), (2, "tenant"), (4, "sku"), (6, "useUnit")] {
            if parts[index] != expected {
                return Err(KeyError::BadMarker {
                    expected,
                    found: parts[index].to_string(),
                });
            }
        }

        let generation = Generation::parse(parts[1])
            .ok_or_else(|| KeyError::BadGeneration(parts[1].to_string()))?;
        let use_unit = parts[7]
            .parse::<PulseUnit>()
            .map_err(|_| KeyError::BadUnit(parts[7].to_string()))?;

        Ok(Self {
            generation,
            tenant_id: parts[3].to_string(),
            product_sku: parts[5].to_string(),
            use_unit,
        })
    }

    /// Match-all pattern for every counter of one generation.
    pub fn scan_pattern(generation: Generation) -> String {
        format!("generation:{generation}:tenant:*:sku:*:useUnit:*")
    }

    /// Rebuilds the pulse this counter aggregates, with the drained total.
    pub fn into_pulse(self, used_amount: f64) -> Pulse {
        Pulse {
            tenant_id: self.tenant_id,
            product_sku: self.product_sku,
            used_amount,
            use_unit: self.use_unit,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation:{}:tenant:{}:sku:{}:useUnit:{}",
            self.generation, self.tenant_id, self.product_sku, self.use_unit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse() -> Pulse {
        Pulse::new("t1", "sku1", 100.0, PulseUnit::Kb).unwrap()
    }

    #[test]
    fn test_display_format() {
        let key = CounterKey::for_pulse(Generation::A, &pulse());
        assert_eq!(key.to_string(), "generation:A:tenant:t1:sku:sku1:useUnit:KB");
    }

    #[test]
    fn test_display_rate_unit() {
        let p = Pulse::new("t2", "s2", 1.0, PulseUnit::MbPerSec).unwrap();
        let key = CounterKey::for_pulse(Generation::B, &p);
        assert_eq!(
            key.to_string(),
            "generation:B:tenant:t2:sku:s2:useUnit:MB/sec"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for unit in PulseUnit::ALL {
            let p = Pulse::new("tenant-9", "SKU-3", 1.0, unit).unwrap();
            let key = CounterKey::for_pulse(Generation::B, &p);
            let parsed = CounterKey::parse(&key.to_string()).unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn test_parse_rejects_wrong_token_count() {
        let err = CounterKey::parse("generation:A:tenant:t1:sku:sku1").unwrap_err();
        assert!(matches!(err, KeyError::TokenCount(6)));
    }

    #[test]
    fn test_parse_rejects_empty_token() {
        let err = CounterKey::parse("generation:A:tenant::sku:sku1:useUnit:KB").unwrap_err();
        assert!(matches!(err, KeyError::EmptyToken));
    }

    #[test]
    fn test_parse_rejects_wrong_marker() {
        let err = CounterKey::parse("gen:A:tenant:t1:sku:sku1:useUnit:KB").unwrap_err();
        assert!(matches!(
            err,
            KeyError::BadMarker {
                expected: "generation",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_generation() {
        let err = CounterKey::parse("generation:C:tenant:t1:sku:sku1:useUnit:KB").unwrap_err();
        assert!(matches!(err, KeyError::BadGeneration(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_unit() {
        let err = CounterKey::parse("generation:A:tenant:t1:sku:sku1:useUnit:TB").unwrap_err();
        assert!(matches!(err, KeyError::BadUnit(_)));
    }

    #[test]
    fn test_parse_rejects_tenant_with_separator() {
        // A tenant id containing ':' shifts the token count; such keys are
        // skipped by the forwarder rather than misattributed.
        let err = CounterKey::parse("generation:A:tenant:a:b:sku:sku1:useUnit:KB").unwrap_err();
        assert!(matches!(err, KeyError::TokenCount(9)));
    }

    #[test]
    fn test_scan_pattern() {
        assert_eq!(
            CounterKey::scan_pattern(Generation::A),
            "generation:A:tenant:*:sku:*:useUnit:*"
        );
    }

    #[test]
    fn test_into_pulse_carries_total() {
        let key = CounterKey::parse("generation:B:tenant:t1:sku:sku1:useUnit:GB").unwrap();
        let p = key.into_pulse(42.5);
        assert_eq!(p.tenant_id, "t1");
        assert_eq!(p.product_sku, "sku1");
        assert_eq!(p.use_unit, PulseUnit::Gb);
        assert!((p.used_amount - 42.5).abs() < f64::EPSILON);
    }
}
