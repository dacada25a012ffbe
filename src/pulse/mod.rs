pub mod key;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Measurement unit attached to a usage pulse.
///
/// The wire representation matches the accounting API exactly, including the
/// rate variants with a slash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PulseUnit {
    #[serde(rename = "KB")]
    Kb,
    #[serde(rename = "MB")]
    Mb,
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "KB/sec")]
    KbPerSec,
    #[serde(rename = "MB/sec")]
    MbPerSec,
    #[serde(rename = "GB/sec")]
    GbPerSec,
}

impl PulseUnit {
    /// All recognized units, in wire order.
    pub const ALL: [PulseUnit; 6] = [
        PulseUnit::Kb,
        PulseUnit::Mb,
        PulseUnit::Gb,
        PulseUnit::KbPerSec,
        PulseUnit::MbPerSec,
        PulseUnit::GbPerSec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PulseUnit::Kb => "KB",
            PulseUnit::Mb => "MB",
            PulseUnit::Gb => "GB",
            PulseUnit::KbPerSec => "KB/sec",
            PulseUnit::MbPerSec => "MB/sec",
            PulseUnit::GbPerSec => "GB/sec",
        }
    }
}

impl fmt::Display for PulseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PulseUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KB" => Ok(PulseUnit::Kb),
            "MB" => Ok(PulseUnit::Mb),
            "GB" => Ok(PulseUnit::Gb),
            "KB/sec" => Ok(PulseUnit::KbPerSec),
            "MB/sec" => Ok(PulseUnit::MbPerSec),
            "GB/sec" => Ok(PulseUnit::GbPerSec),
            other => Err(ValidationError::UnknownUnit(other.to_string())),
        }
    }
}

/// Rejection reasons for ingress records that never enter the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("used_amount must be a finite non-negative number, got {0}")]
    InvalidAmount(f64),
    #[error("unrecognized pulse unit: {0}")]
    UnknownUnit(String),
}

/// One resource-usage event reported by a tenant.
///
/// Immutable once constructed; its contribution is folded into a counter and
/// the record itself is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub tenant_id: String,
    pub product_sku: String,
    pub used_amount: f64,
    pub use_unit: PulseUnit,
}

impl Pulse {
    /// Validating constructor. Tenant and SKU must be non-empty and the
    /// amount finite and non-negative.
    pub fn new(
        tenant_id: impl Into<String>,
        product_sku: impl Into<String>,
        used_amount: f64,
        use_unit: PulseUnit,
    ) -> Result<Self, ValidationError> {
        let tenant_id = tenant_id.into();
        let product_sku = product_sku.into();

        if tenant_id.is_empty() {
            return Err(ValidationError::EmptyField("tenant_id"));
        }
        if product_sku.is_empty() {
            return Err(ValidationError::EmptyField("product_sku"));
        }
        if !used_amount.is_finite() || used_amount < 0.0 {
            return Err(ValidationError::InvalidAmount(used_amount));
        }

        Ok(Self {
            tenant_id,
            product_sku,
            used_amount,
            use_unit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_round_trips_through_str() {
        for unit in PulseUnit::ALL {
            assert_eq!(unit.as_str().parse::<PulseUnit>().unwrap(), unit);
        }
    }

    #[test]
    fn test_unit_rejects_unknown() {
        let err = "TB".parse::<PulseUnit>().unwrap_err();
        assert!(matches!(err, ValidationError::UnknownUnit(u) if u == "TB"));
    }

    #[test]
    fn test_unit_serde_wire_format() {
        let json = serde_json::to_string(&PulseUnit::KbPerSec).unwrap();
        assert_eq!(json, "\"KB/sec\"");

        let unit: PulseUnit = serde_json::from_str("\"GB\"").unwrap();
        assert_eq!(unit, PulseUnit::Gb);
    }

    #[test]
    fn test_pulse_serde_schema() {
        let pulse = Pulse::new("t1", "sku1", 100.0, PulseUnit::Kb).unwrap();
        let json = serde_json::to_value(&pulse).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tenant_id": "t1",
                "product_sku": "sku1",
                "used_amount": 100.0,
                "use_unit": "KB",
            })
        );
    }

    #[test]
    fn test_pulse_rejects_empty_tenant() {
        let err = Pulse::new("", "sku1", 1.0, PulseUnit::Kb).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyField("tenant_id")));
    }

    #[test]
    fn test_pulse_rejects_empty_sku() {
        let err = Pulse::new("t1", "", 1.0, PulseUnit::Kb).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyField("product_sku")));
    }

    #[test]
    fn test_pulse_rejects_negative_amount() {
        let err = Pulse::new("t1", "sku1", -0.5, PulseUnit::Kb).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAmount(_)));
    }

    #[test]
    fn test_pulse_rejects_non_finite_amount() {
        assert!(Pulse::new("t1", "sku1", f64::NAN, PulseUnit::Kb).is_err());
        assert!(Pulse::new("t1", "sku1", f64::INFINITY, PulseUnit::Kb).is_err());
    }

    #[test]
    fn test_pulse_accepts_zero_amount() {
        assert!(Pulse::new("t1", "sku1", 0.0, PulseUnit::Kb).is_ok());
    }
}
