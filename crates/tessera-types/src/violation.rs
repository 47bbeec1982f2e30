//! Violation packets emitted when a guard detects a breach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::Severity;

/// Standardized packet handed to the broadcaster when authorization fails or
/// state drift is detected. Carries enough context for alerting and for the
/// pilot to pick a remedy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationPacket {
    /// Identifier of the breached rule (e.g. `AUTHORIZATION`, `STATE_DRIFT`).
    pub rule_id: String,
    /// How urgent the breach is.
    pub severity: Severity,
    /// Machine-readable breach classification.
    pub violation_type: String,
    /// The UOW concerned, when there is one.
    pub uow_id: Option<Uuid>,
    /// Raw context captured at detection time.
    pub raw_data: Option<serde_json::Value>,
    /// Suggested remediation for the operator.
    pub remedy_suggestion: Option<String>,
    /// Detection timestamp.
    pub timestamp: DateTime<Utc>,
}

impl ViolationPacket {
    /// Build a packet stamped with the current time.
    pub fn new(rule_id: impl Into<String>, severity: Severity, violation_type: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            violation_type: violation_type.into(),
            uow_id: None,
            raw_data: None,
            remedy_suggestion: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the UOW concerned.
    pub fn with_uow(mut self, uow_id: Uuid) -> Self {
        self.uow_id = Some(uow_id);
        self
    }

    /// Attach raw detection context.
    pub fn with_raw_data(mut self, raw: serde_json::Value) -> Self {
        self.raw_data = Some(raw);
        self
    }

    /// Attach a remedy suggestion.
    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy_suggestion = Some(remedy.into());
        self
    }

    /// Serialize for emission on the broadcaster.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "rule_id": self.rule_id,
            "severity": self.severity.as_str(),
            "violation_type": self.violation_type,
            "uow_id": self.uow_id.map(|id| id.to_string()),
            "raw_data": self.raw_data,
            "remedy_suggestion": self.remedy_suggestion,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_serializes_with_string_severity() {
        let packet = ViolationPacket::new("AUTHORIZATION", Severity::Critical, "UNAUTHORIZED_UOW_MODIFICATION")
            .with_uow(Uuid::nil())
            .with_remedy("verify actor credentials");
        let json = packet.to_json();
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["uow_id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["remedy_suggestion"], "verify actor credentials");
    }
}
