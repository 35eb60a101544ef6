//! Whole-store integrity scan for the contract document.
//!
//! Works on the raw JSON so that records which no longer deserialize can
//! still be located and reported. Never writes to the store.

use crate::{ContractValidator, Severity};
use chrono::Utc;
use fleet_core::{Contract, ContractDocument, ContractStatus, FleetResult, Timestamp};
use fleet_storage::DocumentStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The document or a category block does not have the expected shape
    MalformedDocument,
    /// A `contract_id` seen earlier in the walk
    DuplicateId,
    /// A required field is absent
    MissingField,
    /// A value of the wrong type or outside its range
    InvalidValue,
    /// A value that only decodes after coercion (e.g. `"100"` for points)
    CoercedValue,
    /// The record does not decode as a contract at all
    Unparseable,
    /// The record decodes but breaks a lifecycle rule
    Violation,
}

/// One problem found during a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Category key the record sits under
    pub category: Option<String>,
    /// Position within the category's `contracts` array
    pub index: Option<usize>,
    pub contract_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub scanned_at: Timestamp,
    pub categories: usize,
    pub contracts_scanned: usize,
    pub findings: Vec<Finding>,
    /// Recovery steps for a human to consider. Nothing is applied.
    pub suggested_actions: Vec<String>,
}

impl CorruptionReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn errors(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    pub fn summary(&self) -> String {
        if self.is_clean() {
            format!(
                "contract store clean ({} contracts in {} categories)",
                self.contracts_scanned, self.categories
            )
        } else {
            format!(
                "{} findings ({} errors) across {} contracts",
                self.findings.len(),
                self.errors(),
                self.contracts_scanned
            )
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

const REQUIRED_FIELDS: &[&str] = &["contract_id", "status", "title", "points"];

#[derive(Debug, Clone, Copy, Default)]
pub struct CorruptionDetector {
    validator: ContractValidator,
}

/// Walk state for one scan.
struct Scan {
    findings: Vec<Finding>,
    seen: HashSet<String>,
    contracts: usize,
}

impl Scan {
    fn push(
        &mut self,
        kind: FindingKind,
        severity: Severity,
        category: Option<&str>,
        index: Option<usize>,
        contract_id: Option<&str>,
        detail: String,
    ) {
        self.findings.push(Finding {
            kind,
            severity,
            category: category.map(str::to_string),
            index,
            contract_id: contract_id.map(str::to_string),
            detail,
        });
    }
}

impl CorruptionDetector {
    pub fn new(validator: ContractValidator) -> Self {
        Self { validator }
    }

    /// Load the store's raw content and scan it.
    pub fn scan_store(
        &self,
        store: &dyn DocumentStore<ContractDocument>,
    ) -> FleetResult<CorruptionReport> {
        let report = match store.load_raw()? {
            Some(raw) => self.scan(&raw),
            None => self.scan(&serde_json::json!({ "contracts": {} })),
        };
        if report.is_clean() {
            tracing::info!(contracts = report.contracts_scanned, "corruption scan clean");
        } else {
            tracing::warn!(
                findings = report.findings.len(),
                errors = report.errors(),
                "corruption detected in contract store"
            );
        }
        Ok(report)
    }

    pub fn scan(&self, raw: &Value) -> CorruptionReport {
        let mut scan = Scan {
            findings: Vec::new(),
            seen: HashSet::new(),
            contracts: 0,
        };

        let categories = match raw.get("contracts").and_then(Value::as_object) {
            Some(categories) => categories,
            None => {
                scan.push(
                    FindingKind::MalformedDocument,
                    Severity::Error,
                    None,
                    None,
                    None,
                    "top-level `contracts` object is missing".to_string(),
                );
                return self.finish(scan, 0);
            }
        };

        for (category, block) in categories {
            let records = match block.get("contracts").and_then(Value::as_array) {
                Some(records) => records,
                None => {
                    scan.push(
                        FindingKind::MalformedDocument,
                        Severity::Error,
                        Some(category.as_str()),
                        None,
                        None,
                        "category has no `contracts` array".to_string(),
                    );
                    continue;
                }
            };
            for (index, record) in records.iter().enumerate() {
                scan.contracts += 1;
                self.scan_record(&mut scan, category, index, record);
            }
        }

        let count = categories.len();
        self.finish(scan, count)
    }

    fn scan_record(&self, scan: &mut Scan, category: &str, index: usize, record: &Value) {
        let Some(fields) = record.as_object() else {
            scan.push(
                FindingKind::Unparseable,
                Severity::Error,
                Some(category),
                Some(index),
                None,
                "record is not an object".to_string(),
            );
            return;
        };

        let id = fields.get("contract_id").and_then(Value::as_str);
        if let Some(id) = id {
            if !scan.seen.insert(id.to_string()) {
                scan.push(
                    FindingKind::DuplicateId,
                    Severity::Error,
                    Some(category),
                    Some(index),
                    Some(id),
                    format!("contract_id {id} already appeared earlier in the store"),
                );
            }
        }

        for field in REQUIRED_FIELDS {
            if fields.get(*field).map_or(true, Value::is_null) {
                let severity = if *field == "title" || *field == "points" {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                scan.push(
                    FindingKind::MissingField,
                    severity,
                    Some(category),
                    Some(index),
                    id,
                    format!("missing `{field}`"),
                );
            }
        }

        let mut normalized = record.clone();
        let mut decodable = true;

        match fields.get("points") {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(p) if p < 0 => scan.push(
                    FindingKind::InvalidValue,
                    Severity::Error,
                    Some(category),
                    Some(index),
                    id,
                    format!("negative points: {p}"),
                ),
                Some(_) => {}
                None => {
                    scan.push(
                        FindingKind::InvalidValue,
                        Severity::Error,
                        Some(category),
                        Some(index),
                        id,
                        format!("points is not an integer: {n}"),
                    );
                    decodable = false;
                }
            },
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(p) => {
                    scan.push(
                        FindingKind::CoercedValue,
                        Severity::Warning,
                        Some(category),
                        Some(index),
                        id,
                        format!("points stored as string {s:?}"),
                    );
                    if p < 0 {
                        scan.push(
                            FindingKind::InvalidValue,
                            Severity::Error,
                            Some(category),
                            Some(index),
                            id,
                            format!("negative points: {p}"),
                        );
                    }
                    normalized["points"] = Value::from(p);
                }
                Err(_) => {
                    scan.push(
                        FindingKind::InvalidValue,
                        Severity::Error,
                        Some(category),
                        Some(index),
                        id,
                        format!("points is not numeric: {s:?}"),
                    );
                    decodable = false;
                }
            },
            Some(Value::Null) | None => {}
            Some(other) => {
                scan.push(
                    FindingKind::InvalidValue,
                    Severity::Error,
                    Some(category),
                    Some(index),
                    id,
                    format!("points has wrong type: {other}"),
                );
                decodable = false;
            }
        }

        if let Some(status) = fields.get("status").and_then(Value::as_str) {
            match ContractStatus::from_db_str(status.trim()) {
                Ok(parsed) if parsed.as_db_str() != status => {
                    scan.push(
                        FindingKind::CoercedValue,
                        Severity::Warning,
                        Some(category),
                        Some(index),
                        id,
                        format!("status {status:?} is not in canonical form"),
                    );
                    normalized["status"] = Value::from(parsed.as_db_str());
                }
                Ok(_) => {}
                Err(e) => {
                    scan.push(
                        FindingKind::InvalidValue,
                        Severity::Error,
                        Some(category),
                        Some(index),
                        id,
                        e.to_string(),
                    );
                    decodable = false;
                }
            }
        }

        if !decodable {
            return;
        }
        match serde_json::from_value::<Contract>(normalized) {
            Ok(contract) => {
                for v in self.validator.validate(&contract) {
                    // Already reported from the raw value above
                    if v.field == "points" || (v.field == "title" && !fields.contains_key("title")) {
                        continue;
                    }
                    scan.push(
                        FindingKind::Violation,
                        v.severity,
                        Some(category),
                        Some(index),
                        Some(contract.contract_id.as_str()),
                        v.message,
                    );
                }
            }
            Err(e) => scan.push(
                FindingKind::Unparseable,
                Severity::Error,
                Some(category),
                Some(index),
                id,
                e.to_string(),
            ),
        }
    }

    fn finish(&self, scan: Scan, categories: usize) -> CorruptionReport {
        let kinds: BTreeSet<FindingKind> = scan.findings.iter().map(|f| f.kind).collect();
        let suggested_actions = kinds.into_iter().map(suggestion).map(str::to_string).collect();
        CorruptionReport {
            scanned_at: Utc::now(),
            categories,
            contracts_scanned: scan.contracts,
            findings: scan.findings,
            suggested_actions,
        }
    }
}

fn suggestion(kind: FindingKind) -> &'static str {
    match kind {
        FindingKind::MalformedDocument => {
            "restore the contract document from the last known-good copy before any further claims"
        }
        FindingKind::DuplicateId => {
            "keep the first occurrence of each duplicated contract_id and reissue the others under new ids"
        }
        FindingKind::MissingField => "fill in the missing fields from the seeding source",
        FindingKind::InvalidValue => "correct out-of-range or non-numeric values by hand",
        FindingKind::CoercedValue => "rewrite coerced values in their canonical form",
        FindingKind::Unparseable => "inspect unparseable records and rebuild them from the seeding source",
        FindingKind::Violation => {
            "reset contracts with inconsistent lifecycle fields to their last valid state"
        }
    }
}
