//! Declarative config schema validation
//!
//! Plugins describe the shape of their provider and module configs with a
//! small declarative schema. Validation applies defaults top-down first, then
//! checks the value; every problem is reported with a JSON-Pointer style path
//! so the user can find the offending key. A value can be validated against a
//! chain of schemas (the concrete plugin's, then each base's) and must
//! satisfy all of them.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{GardenError, GardenResult};

#[derive(Debug, Clone)]
pub struct Schema {
    pub kind: SchemaKind,
    pub required: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
    pub pattern: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SchemaKind {
    Object {
        fields: BTreeMap<String, Schema>,
        /// Whether keys outside `fields` are tolerated. Plugin spec schemas
        /// generally allow unknown keys so base schemas can layer.
        allow_unknown: bool,
    },
    Array {
        items: Box<Schema>,
    },
    String,
    Number,
    Boolean,
    Any,
}

impl Schema {
    pub fn object(fields: impl IntoIterator<Item = (&'static str, Schema)>) -> Self {
        Self::new(SchemaKind::Object {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            allow_unknown: true,
        })
    }

    pub fn strict_object(fields: impl IntoIterator<Item = (&'static str, Schema)>) -> Self {
        let mut schema = Self::object(fields);
        if let SchemaKind::Object { allow_unknown, .. } = &mut schema.kind {
            *allow_unknown = false;
        }
        schema
    }

    pub fn array(items: Schema) -> Self {
        Self::new(SchemaKind::Array {
            items: Box::new(items),
        })
    }

    pub fn string() -> Self {
        Self::new(SchemaKind::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaKind::Boolean)
    }

    pub fn any() -> Self {
        Self::new(SchemaKind::Any)
    }

    fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            allowed: None,
            pattern: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn allowed(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = Some(values.into_iter().collect());
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn described(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    /// Apply defaults and validate, returning the defaulted value
    pub fn validate(&self, value: &Value, label: &str) -> GardenResult<Value> {
        let mut defaulted = value.clone();
        apply_defaults(self, &mut defaulted);

        let mut problems = Vec::new();
        check(self, &defaulted, "", &mut problems);

        if problems.is_empty() {
            Ok(defaulted)
        } else {
            Err(GardenError::Configuration {
                message: format!(
                    "{} failed validation:\n{}",
                    label,
                    problems
                        .iter()
                        .map(|(path, msg)| format!("  {}: {}", display_path(path), msg))
                        .collect::<Vec<_>>()
                        .join("\n")
                ),
                path: Some(label.to_string()),
                source: None,
                hint: self.description.clone(),
            })
        }
    }
}

/// Validate a value against each schema in order. Defaults applied by earlier
/// schemas are visible to later ones; the final value satisfies all.
pub fn validate_all<'a>(
    value: &Value,
    schemas: impl IntoIterator<Item = &'a Schema>,
    label: &str,
) -> GardenResult<Value> {
    let mut current = value.clone();
    for schema in schemas {
        current = schema.validate(&current, label)?;
    }
    Ok(current)
}

fn apply_defaults(schema: &Schema, value: &mut Value) {
    if value.is_null() {
        if let Some(default) = &schema.default {
            *value = default.clone();
        }
    }
    match (&schema.kind, value) {
        (SchemaKind::Object { fields, .. }, Value::Object(map)) => {
            for (key, field_schema) in fields {
                match map.get_mut(key) {
                    Some(existing) => apply_defaults(field_schema, existing),
                    None => {
                        if let Some(default) = &field_schema.default {
                            let mut filled = default.clone();
                            apply_defaults(field_schema, &mut filled);
                            map.insert(key.clone(), filled);
                        } else if matches!(field_schema.kind, SchemaKind::Object { .. })
                            && has_nested_defaults(field_schema)
                        {
                            let mut filled = Value::Object(Map::new());
                            apply_defaults(field_schema, &mut filled);
                            map.insert(key.clone(), filled);
                        }
                    }
                }
            }
        }
        (SchemaKind::Array { items }, Value::Array(entries)) => {
            for entry in entries {
                apply_defaults(items, entry);
            }
        }
        _ => {}
    }
}

fn has_nested_defaults(schema: &Schema) -> bool {
    match &schema.kind {
        SchemaKind::Object { fields, .. } => fields
            .values()
            .any(|f| f.default.is_some() || has_nested_defaults(f)),
        _ => false,
    }
}

fn check(schema: &Schema, value: &Value, path: &str, problems: &mut Vec<(String, String)>) {
    if value.is_null() {
        if schema.required {
            problems.push((path.to_string(), "required value is missing".to_string()));
        }
        return;
    }

    match &schema.kind {
        SchemaKind::Any => {}
        SchemaKind::String => {
            let Some(s) = value.as_str() else {
                problems.push((path.to_string(), expected("string", value)));
                return;
            };
            if let Some(pattern) = &schema.pattern {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            problems.push((
                                path.to_string(),
                                format!("value '{}' does not match pattern '{}'", s, pattern),
                            ));
                        }
                    }
                    Err(e) => problems.push((
                        path.to_string(),
                        format!("schema pattern '{}' is invalid: {}", pattern, e),
                    )),
                }
            }
        }
        SchemaKind::Number => {
            if !value.is_number() {
                problems.push((path.to_string(), expected("number", value)));
                return;
            }
        }
        SchemaKind::Boolean => {
            if !value.is_boolean() {
                problems.push((path.to_string(), expected("boolean", value)));
                return;
            }
        }
        SchemaKind::Array { items } => {
            let Some(entries) = value.as_array() else {
                problems.push((path.to_string(), expected("array", value)));
                return;
            };
            for (i, entry) in entries.iter().enumerate() {
                check(items, entry, &format!("{}/{}", path, i), problems);
            }
        }
        SchemaKind::Object {
            fields,
            allow_unknown,
        } => {
            let Some(map) = value.as_object() else {
                problems.push((path.to_string(), expected("object", value)));
                return;
            };
            for (key, field_schema) in fields {
                let field_path = format!("{}/{}", path, key);
                match map.get(key) {
                    Some(field_value) => check(field_schema, field_value, &field_path, problems),
                    None => {
                        if field_schema.required {
                            problems.push((field_path, "required field is missing".to_string()));
                        }
                    }
                }
            }
            if !allow_unknown {
                for key in map.keys() {
                    if !fields.contains_key(key) {
                        problems.push((
                            format!("{}/{}", path, key),
                            "unknown field is not allowed here".to_string(),
                        ));
                    }
                }
            }
        }
    }

    if let Some(allowed) = &schema.allowed {
        if !allowed.contains(value) {
            problems.push((
                path.to_string(),
                format!(
                    "value {} is not one of the allowed values: {}",
                    value,
                    allowed
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }
    }
}

fn expected(kind: &str, value: &Value) -> String {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("expected {}, got {}", kind, actual)
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_schema() -> Schema {
        Schema::object([
            ("name", Schema::string().required()),
            (
                "replicas",
                Schema::number().with_default(json!(1)).described("instance count"),
            ),
            (
                "protocol",
                Schema::string()
                    .with_default(json!("http"))
                    .allowed([json!("http"), json!("grpc")]),
            ),
            (
                "ports",
                Schema::array(Schema::object([
                    ("name", Schema::string().required()),
                    ("number", Schema::number().required()),
                ])),
            ),
        ])
    }

    #[test]
    fn defaults_applied_before_validation() {
        let out = service_schema()
            .validate(&json!({"name": "web"}), "service web")
            .unwrap();
        assert_eq!(out["replicas"], json!(1));
        assert_eq!(out["protocol"], json!("http"));
    }

    #[test]
    fn missing_required_field_reports_pointer_path() {
        let err = service_schema()
            .validate(&json!({"ports": [{"number": 80}]}), "service web")
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("/name"), "{text}");
        assert!(text.contains("/ports/0/name"), "{text}");
    }

    #[test]
    fn disallowed_value_rejected() {
        let err = service_schema()
            .validate(&json!({"name": "web", "protocol": "udp"}), "service web")
            .unwrap_err();
        assert!(err.to_string().contains("allowed values"));
    }

    #[test]
    fn pattern_mismatch_rejected() {
        let schema = Schema::object([(
            "name",
            Schema::string().required().pattern("^[a-z][a-z0-9-]*$"),
        )]);
        let err = schema
            .validate(&json!({"name": "Bad_Name"}), "module")
            .unwrap_err();
        assert!(err.to_string().contains("does not match pattern"));
    }

    #[test]
    fn strict_object_rejects_unknown_keys() {
        let schema = Schema::strict_object([("name", Schema::string())]);
        let err = schema
            .validate(&json!({"name": "a", "nmae": "b"}), "config")
            .unwrap_err();
        assert!(err.to_string().contains("/nmae"));
    }

    #[test]
    fn chained_schemas_all_apply() {
        let base = Schema::object([("logLevel", Schema::string().with_default(json!("info")))]);
        let leaf = Schema::object([("endpoint", Schema::string().required())]);
        let out = validate_all(
            &json!({"endpoint": "http://localhost"}),
            [&leaf, &base],
            "provider test-a",
        )
        .unwrap();
        assert_eq!(out["logLevel"], json!("info"));
        assert_eq!(out["endpoint"], json!("http://localhost"));
    }

    #[test]
    fn chained_schema_failure_names_which_label() {
        let base = Schema::object([("region", Schema::string().required())]);
        let leaf = Schema::object([]);
        let err = validate_all(&json!({}), [&leaf, &base], "provider test-b").unwrap_err();
        assert!(err.to_string().contains("provider test-b"));
    }
}
