//! Versioned payload contracts for the seams between components.
//!
//! Every payload that crosses a boundary (work orders into the coder, coder
//! results back out, validation reports) is validated and normalized here.
//! Normalization applies legacy field renames and defaults; every applied
//! transform is recorded so events can report what was touched.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::ContractError;
use crate::models::RETURN_FORMAT_UNIFIED_DIFF;

/// Expected JSON type for a contract field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// One field in a contract schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Inserted when the field is absent. Implies `required: false`.
    pub default: Option<Value>,
    /// When set, a present field must equal this exact value.
    pub expect: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            expect: None,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            expect: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    pub fn with_expect(mut self, expect: Value) -> Self {
        self.expect = Some(expect);
        self
    }
}

/// Schema for one payload kind at one version.
#[derive(Debug, Clone)]
pub struct ContractSchema {
    pub kind: &'static str,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    /// Legacy field renames applied before validation (old name, new name).
    pub renames: Vec<(&'static str, &'static str)>,
}

/// A validated payload plus the list of normalization transforms applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub payload: Value,
    pub transforms: Vec<String>,
}

/// Registry of payload contracts, keyed by kind.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    schemas: HashMap<&'static str, ContractSchema>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. A second registration for the same kind is a
    /// programming error and is rejected.
    pub fn register(&mut self, schema: ContractSchema) -> Result<(), ContractError> {
        if self.schemas.contains_key(schema.kind) {
            return Err(ContractError::DuplicateKind {
                kind: schema.kind.to_string(),
            });
        }
        self.schemas.insert(schema.kind, schema);
        Ok(())
    }

    pub fn schema(&self, kind: &str) -> Option<&ContractSchema> {
        self.schemas.get(kind)
    }

    /// Validate and normalize a payload against the registered schema for
    /// `kind`. Returns the normalized payload and the transforms applied.
    pub fn validate(&self, kind: &str, payload: &Value) -> Result<Normalized, ContractError> {
        let schema = self.schemas.get(kind).ok_or_else(|| ContractError::SchemaViolation {
            kind: kind.to_string(),
            field: "<kind>".to_string(),
            reason: "no contract registered for this kind".to_string(),
        })?;

        let mut obj = match payload.as_object() {
            Some(map) => map.clone(),
            None => {
                return Err(ContractError::SchemaViolation {
                    kind: kind.to_string(),
                    field: "<root>".to_string(),
                    reason: "payload must be a JSON object".to_string(),
                })
            }
        };
        let mut transforms = Vec::new();

        for (old, new) in &schema.renames {
            if obj.contains_key(*new) {
                continue;
            }
            if let Some(value) = obj.remove(*old) {
                obj.insert((*new).to_string(), value);
                transforms.push(format!("renamed '{}' to '{}'", old, new));
            }
        }

        for field in &schema.fields {
            match obj.get(field.name) {
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(ContractError::SchemaViolation {
                            kind: kind.to_string(),
                            field: field.name.to_string(),
                            reason: format!("expected {}", field.kind.name()),
                        });
                    }
                    if let Some(expect) = &field.expect {
                        if value != expect {
                            return Err(ContractError::SchemaViolation {
                                kind: kind.to_string(),
                                field: field.name.to_string(),
                                reason: format!("must equal {}", expect),
                            });
                        }
                    }
                }
                None => {
                    if let Some(default) = &field.default {
                        obj.insert(field.name.to_string(), default.clone());
                        transforms.push(format!("defaulted '{}'", field.name));
                    } else if field.required {
                        return Err(ContractError::SchemaViolation {
                            kind: kind.to_string(),
                            field: field.name.to_string(),
                            reason: "missing required field".to_string(),
                        });
                    }
                }
            }
        }

        Ok(Normalized {
            payload: Value::Object(obj),
            transforms,
        })
    }
}

pub const KIND_WORK_ORDER: &str = "work_order";
pub const KIND_CODER_RESULT: &str = "coder_result";
pub const KIND_VALIDATION_REPORT: &str = "validation_report";

/// The registry with the three built-in v1 contracts.
pub fn default_registry() -> ContractRegistry {
    let mut registry = ContractRegistry::new();

    registry
        .register(ContractSchema {
            kind: KIND_WORK_ORDER,
            version: 1,
            fields: vec![
                FieldSpec::required("work_order_id", FieldKind::String),
                FieldSpec::required("title", FieldKind::String),
                FieldSpec::required("objective", FieldKind::String),
                FieldSpec::optional("constraints", FieldKind::Array)
                    .with_default(Value::Array(vec![])),
                FieldSpec::optional("acceptance_criteria", FieldKind::Array)
                    .with_default(Value::Array(vec![])),
                FieldSpec::optional("context_files", FieldKind::Array)
                    .with_default(Value::Array(vec![])),
                FieldSpec::optional("return_format", FieldKind::String)
                    .with_default(Value::String(RETURN_FORMAT_UNIFIED_DIFF.to_string()))
                    .with_expect(Value::String(RETURN_FORMAT_UNIFIED_DIFF.to_string())),
            ],
            renames: vec![("objectives", "objective")],
        })
        .expect("built-in contracts register once");

    registry
        .register(ContractSchema {
            kind: KIND_CODER_RESULT,
            version: 1,
            fields: vec![
                FieldSpec::required("work_order_id", FieldKind::String),
                FieldSpec::required("diff", FieldKind::String),
                FieldSpec::optional("notes", FieldKind::String),
            ],
            renames: vec![],
        })
        .expect("built-in contracts register once");

    registry
        .register(ContractSchema {
            kind: KIND_VALIDATION_REPORT,
            version: 1,
            fields: vec![
                FieldSpec::required("step_id", FieldKind::String),
                FieldSpec::optional("fatal", FieldKind::Array)
                    .with_default(Value::Array(vec![])),
                FieldSpec::optional("warnings", FieldKind::Array)
                    .with_default(Value::Array(vec![])),
                FieldSpec::optional("metrics", FieldKind::Object),
            ],
            renames: vec![],
        })
        .expect("built-in contracts register once");

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn work_order_payload() -> Value {
        json!({
            "work_order_id": Uuid::new_v4().to_string(),
            "title": "Add login form",
            "objective": "Render and wire the login form",
            "return_format": "unified-diff",
        })
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut registry = default_registry();
        let err = registry
            .register(ContractSchema {
                kind: KIND_WORK_ORDER,
                version: 2,
                fields: vec![],
                renames: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, ContractError::DuplicateKind { .. }));
    }

    #[test]
    fn valid_work_order_passes_with_defaults_recorded() {
        let registry = default_registry();
        let normalized = registry
            .validate(KIND_WORK_ORDER, &work_order_payload())
            .unwrap();
        assert_eq!(normalized.payload["constraints"], json!([]));
        assert!(normalized
            .transforms
            .iter()
            .any(|t| t.contains("constraints")));
    }

    #[test]
    fn legacy_objectives_field_is_renamed() {
        let registry = default_registry();
        let payload = json!({
            "work_order_id": Uuid::new_v4().to_string(),
            "title": "t",
            "objectives": "legacy objective text",
        });
        let normalized = registry.validate(KIND_WORK_ORDER, &payload).unwrap();
        assert_eq!(normalized.payload["objective"], "legacy objective text");
        assert!(normalized.payload.get("objectives").is_none());
        assert!(normalized
            .transforms
            .iter()
            .any(|t| t.contains("objectives")));
    }

    #[test]
    fn missing_objective_is_a_schema_violation() {
        let registry = default_registry();
        let payload = json!({
            "work_order_id": Uuid::new_v4().to_string(),
            "title": "t",
        });
        let err = registry.validate(KIND_WORK_ORDER, &payload).unwrap_err();
        match err {
            ContractError::SchemaViolation { field, .. } => assert_eq!(field, "objective"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsupported_return_format_is_rejected() {
        let registry = default_registry();
        let mut payload = work_order_payload();
        payload["return_format"] = json!("full-files");
        let err = registry.validate(KIND_WORK_ORDER, &payload).unwrap_err();
        match err {
            ContractError::SchemaViolation { field, .. } => assert_eq!(field, "return_format"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn absent_return_format_defaults_to_unified_diff() {
        let registry = default_registry();
        let mut payload = work_order_payload();
        payload.as_object_mut().unwrap().remove("return_format");
        let normalized = registry.validate(KIND_WORK_ORDER, &payload).unwrap();
        assert_eq!(normalized.payload["return_format"], "unified-diff");
    }

    #[test]
    fn coder_result_requires_diff_string() {
        let registry = default_registry();
        let payload = json!({
            "work_order_id": Uuid::new_v4().to_string(),
            "diff": 42,
        });
        let err = registry.validate(KIND_CODER_RESULT, &payload).unwrap_err();
        match err {
            ContractError::SchemaViolation { field, reason, .. } => {
                assert_eq!(field, "diff");
                assert!(reason.contains("string"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let registry = default_registry();
        let err = registry
            .validate(KIND_CODER_RESULT, &json!("just a string"))
            .unwrap_err();
        assert!(matches!(err, ContractError::SchemaViolation { .. }));
    }

    #[test]
    fn unknown_kind_is_a_schema_violation() {
        let registry = default_registry();
        let err = registry.validate("mystery", &json!({})).unwrap_err();
        assert!(matches!(err, ContractError::SchemaViolation { .. }));
    }

    #[test]
    fn validation_report_payload_round_trips_through_contract() {
        let registry = default_registry();
        let report = crate::models::ValidationReport::clean(Uuid::new_v4());
        let payload = serde_json::to_value(&report).unwrap();
        let normalized = registry
            .validate(KIND_VALIDATION_REPORT, &payload)
            .unwrap();
        assert!(normalized.transforms.is_empty());
    }
}
