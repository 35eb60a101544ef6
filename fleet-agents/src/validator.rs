//! Contract field and lifecycle checks.
//!
//! Pure functions over [`Contract`] records. `ContractManager` runs them on
//! every record it is about to write; `CorruptionDetector` runs them on
//! every record already on disk.

use fleet_core::{Contract, ContractStatus, ValidationError};
use serde::{Deserialize, Serialize};

// ============================================================================
// VIOLATION TYPES
// ============================================================================

/// Severity of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Suspicious but consistent
    Warning,
    /// The record breaks a lifecycle invariant
    Error,
}

/// Which rule a violation broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A field the status requires is absent or blank
    MissingField,
    /// A field the status forbids is present
    UnexpectedField,
    /// A value outside its legal range
    OutOfRange,
    /// Timestamps out of order
    Chronology,
}

/// One broken rule on one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub contract_id: String,
    pub severity: Severity,
    pub kind: ViolationKind,
    pub field: String,
    pub message: String,
}

impl Violation {
    fn error(contract: &Contract, kind: ViolationKind, field: &str, message: String) -> Self {
        Self {
            contract_id: contract.contract_id.clone(),
            severity: Severity::Error,
            kind,
            field: field.to_string(),
            message,
        }
    }

    fn warning(contract: &Contract, kind: ViolationKind, field: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(contract, kind, field, message)
        }
    }

    /// Convert to the error returned to callers that tried to write.
    pub fn into_error(self) -> ValidationError {
        match self.kind {
            ViolationKind::MissingField => ValidationError::RequiredFieldMissing { field: self.field },
            ViolationKind::OutOfRange => ValidationError::InvalidValue {
                field: self.field,
                reason: self.message,
            },
            ViolationKind::UnexpectedField | ViolationKind::Chronology => {
                ValidationError::ConstraintViolation {
                    constraint: self.field,
                    reason: self.message,
                }
            }
        }
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ContractValidator;

impl ContractValidator {
    pub fn new() -> Self {
        Self
    }

    /// Every rule the record breaks, errors first.
    pub fn validate(&self, contract: &Contract) -> Vec<Violation> {
        let mut out = Vec::new();

        if contract.contract_id.trim().is_empty() {
            out.push(Violation::error(
                contract,
                ViolationKind::MissingField,
                "contract_id",
                "contract_id is blank".to_string(),
            ));
        }
        if contract.points < 0 {
            out.push(Violation::error(
                contract,
                ViolationKind::OutOfRange,
                "points",
                format!("points must be >= 0, got {}", contract.points),
            ));
        }
        if contract.title.trim().is_empty() {
            out.push(Violation::warning(
                contract,
                ViolationKind::MissingField,
                "title",
                "title is blank".to_string(),
            ));
        }

        let claimant = contract
            .claimed_by
            .as_deref()
            .filter(|s| !s.trim().is_empty());
        let has_deliverables = contract
            .deliverables
            .as_ref()
            .is_some_and(|d| d.iter().any(|s| !s.trim().is_empty()));

        let mut require = |present: bool, field: &str| {
            if !present {
                out.push(Violation::error(
                    contract,
                    ViolationKind::MissingField,
                    field,
                    format!("{} contract must have {}", contract.status, field),
                ));
            }
        };
        match contract.status {
            ContractStatus::Available => {}
            ContractStatus::Claimed => {
                require(claimant.is_some(), "claimed_by");
                require(contract.claimed_at.is_some(), "claimed_at");
            }
            ContractStatus::Completed => {
                require(claimant.is_some(), "claimed_by");
                require(contract.claimed_at.is_some(), "claimed_at");
                require(contract.completed_at.is_some(), "completed_at");
                require(has_deliverables, "deliverables");
            }
        }

        let mut forbid = |present: bool, field: &str| {
            if present {
                out.push(Violation::error(
                    contract,
                    ViolationKind::UnexpectedField,
                    field,
                    format!("{} contract must not have {}", contract.status, field),
                ));
            }
        };
        match contract.status {
            ContractStatus::Available => {
                forbid(contract.claimed_by.is_some(), "claimed_by");
                forbid(contract.claimed_at.is_some(), "claimed_at");
                forbid(contract.completed_at.is_some(), "completed_at");
                forbid(contract.deliverables.is_some(), "deliverables");
            }
            ContractStatus::Claimed => {
                forbid(contract.completed_at.is_some(), "completed_at");
                forbid(contract.deliverables.is_some(), "deliverables");
            }
            ContractStatus::Completed => {}
        }

        if let (Some(claimed), Some(completed)) = (contract.claimed_at, contract.completed_at) {
            if completed < claimed {
                out.push(Violation::warning(
                    contract,
                    ViolationKind::Chronology,
                    "completed_at",
                    "completed_at precedes claimed_at".to_string(),
                ));
            }
        }

        out.sort_by(|a, b| b.severity.cmp(&a.severity));
        out
    }

    /// `Ok` unless the record has an error-level violation.
    pub fn check(&self, contract: &Contract) -> Result<(), ValidationError> {
        match self
            .validate(contract)
            .into_iter()
            .find(|v| v.severity == Severity::Error)
        {
            Some(v) => Err(v.into_error()),
            None => Ok(()),
        }
    }

    /// Check that `next` is a legal successor of `prev` and is itself valid.
    pub fn validate_transition(&self, prev: &Contract, next: &Contract) -> Result<(), ValidationError> {
        if prev.contract_id != next.contract_id {
            return Err(ValidationError::ConstraintViolation {
                constraint: "contract_id".to_string(),
                reason: format!("{} cannot become {}", prev.contract_id, next.contract_id),
            });
        }
        if !prev.status.can_transition_to(next.status) {
            return Err(ValidationError::InvalidTransition {
                from: prev.status.to_string(),
                to: next.status.to_string(),
            });
        }
        if next.status == ContractStatus::Completed
            && (next.claimed_by != prev.claimed_by || next.claimed_at != prev.claimed_at)
        {
            return Err(ValidationError::ConstraintViolation {
                constraint: "claimed_by".to_string(),
                reason: "claimant changed on completion".to_string(),
            });
        }
        self.check(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn available() -> Contract {
        Contract::available("C-100", "testing", "Write tests", 100)
    }

    #[test]
    fn test_well_formed_lifecycle_is_clean() {
        let v = ContractValidator::new();
        let now = Utc::now();
        let a = available();
        let c = a.claimed("Agent-1", now);
        let d = c.completed(vec!["report.md".to_string()], now);
        assert!(v.validate(&a).is_empty());
        assert!(v.validate(&c).is_empty());
        assert!(v.validate(&d).is_empty());
        assert!(v.validate_transition(&a, &c).is_ok());
        assert!(v.validate_transition(&c, &d).is_ok());
    }

    #[test]
    fn test_available_with_claimant_is_error() {
        let mut c = available();
        c.claimed_by = Some("Agent-1".to_string());
        let violations = ContractValidator::new().validate(&c);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::UnexpectedField);
        assert_eq!(violations[0].field, "claimed_by");
    }

    #[test]
    fn test_claimed_missing_timestamp() {
        let mut c = available().claimed("Agent-1", Utc::now());
        c.claimed_at = None;
        let err = ContractValidator::new().check(&c).unwrap_err();
        assert_eq!(
            err,
            ValidationError::RequiredFieldMissing {
                field: "claimed_at".to_string()
            }
        );
    }

    #[test]
    fn test_completed_requires_nonempty_deliverables() {
        let now = Utc::now();
        let done = available()
            .claimed("Agent-1", now)
            .completed(vec!["  ".to_string()], now);
        let violations = ContractValidator::new().validate(&done);
        assert!(violations
            .iter()
            .any(|v| v.field == "deliverables" && v.severity == Severity::Error));
    }

    #[test]
    fn test_negative_points_and_blank_title() {
        let mut c = available();
        c.points = -5;
        c.title.clear();
        let violations = ContractValidator::new().validate(&c);
        assert_eq!(violations.len(), 2);
        // Errors sort first
        assert_eq!(violations[0].severity, Severity::Error);
        assert_eq!(violations[0].kind, ViolationKind::OutOfRange);
        assert_eq!(violations[1].severity, Severity::Warning);
    }

    #[test]
    fn test_chronology_is_warning_only() {
        let now = Utc::now();
        let done = available()
            .claimed("Agent-1", now)
            .completed(vec!["x".to_string()], now - Duration::hours(1));
        let v = ContractValidator::new();
        assert_eq!(v.validate(&done)[0].kind, ViolationKind::Chronology);
        assert!(v.check(&done).is_ok());
    }

    #[test]
    fn test_illegal_transitions() {
        let v = ContractValidator::new();
        let now = Utc::now();
        let a = available();
        let done = a
            .claimed("Agent-1", now)
            .completed(vec!["x".to_string()], now);
        assert!(matches!(
            v.validate_transition(&a, &done),
            Err(ValidationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            v.validate_transition(&done, &a),
            Err(ValidationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_claimant_must_not_change_on_completion() {
        let v = ContractValidator::new();
        let now = Utc::now();
        let claimed = available().claimed("Agent-1", now);
        let mut done = claimed.completed(vec!["x".to_string()], now);
        done.claimed_by = Some("Agent-2".to_string());
        assert!(matches!(
            v.validate_transition(&claimed, &done),
            Err(ValidationError::ConstraintViolation { .. })
        ));
    }
}
