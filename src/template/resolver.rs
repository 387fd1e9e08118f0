//! Reference resolution with cycle detection

use serde_json::{Map, Value};
use tracing::trace;

use super::context::TemplateContext;
use super::parser::{parse_template, Segment};
use crate::error::{GardenError, GardenResult};

/// Which resolution pass is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplatePass {
    /// Config load: `runtime.*` references are left verbatim for later
    Static,
    /// Just before a handler invocation: every reference must resolve.
    /// Unresolvable `runtime.*` expressions are collected so the caller can
    /// report all of them at once.
    Runtime,
}

/// Outcome of resolving a config value
#[derive(Debug, Clone)]
pub struct Resolution {
    pub value: Value,
    /// Raw `${runtime.*}` expressions that could not be resolved. Empty after
    /// a successful runtime pass; the static pass defers these by design.
    pub unresolved: Vec<String>,
}

/// Resolve every template string inside a config value tree
pub fn resolve_config(
    value: &Value,
    context: &TemplateContext,
    pass: TemplatePass,
) -> GardenResult<Resolution> {
    let mut trail = Vec::new();
    let mut unresolved = Vec::new();
    let resolved = resolve_node(value, context, pass, &mut trail, &mut unresolved)?;
    Ok(Resolution {
        value: resolved,
        unresolved,
    })
}

/// Resolve a single string value
pub fn resolve_string(
    input: &str,
    context: &TemplateContext,
    pass: TemplatePass,
) -> GardenResult<Resolution> {
    resolve_config(&Value::String(input.to_string()), context, pass)
}

/// Collect the dotted paths of every reference in a config value tree,
/// without resolving anything. Used to derive implicit dependencies.
pub fn collect_references(value: &Value) -> Vec<Vec<String>> {
    let mut found = Vec::new();
    collect_into(value, &mut found);
    found
}

fn collect_into(value: &Value, found: &mut Vec<Vec<String>>) {
    match value {
        Value::String(s) => {
            for (path, _) in parse_template(s).references() {
                found.push(path.to_vec());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_into(v, found)),
        _ => {}
    }
}

fn resolve_node(
    value: &Value,
    context: &TemplateContext,
    pass: TemplatePass,
    trail: &mut Vec<String>,
    unresolved: &mut Vec<String>,
) -> GardenResult<Value> {
    match value {
        Value::String(s) => resolve_template_string(s, context, pass, trail, unresolved),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_node(item, context, pass, trail, unresolved)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(
                    key.clone(),
                    resolve_node(item, context, pass, trail, unresolved)?,
                );
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_template_string(
    input: &str,
    context: &TemplateContext,
    pass: TemplatePass,
    trail: &mut Vec<String>,
    unresolved: &mut Vec<String>,
) -> GardenResult<Value> {
    let template = parse_template(input);
    if !template.has_references() {
        return Ok(Value::String(input.to_string()));
    }

    // A reference that is the entire value keeps its JSON type
    if template.is_whole_reference() {
        let (path, raw) = template.references().next().unwrap();
        return match resolve_reference(path, raw, context, pass, trail, unresolved)? {
            Some(resolved) => Ok(resolved),
            None => Ok(Value::String(raw.to_string())),
        };
    }

    let mut out = String::new();
    for segment in &template.segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Reference { path, raw } => {
                match resolve_reference(path, raw, context, pass, trail, unresolved)? {
                    Some(resolved) => out.push_str(&stringify_scalar(&resolved, raw, trail)?),
                    None => out.push_str(raw),
                }
            }
        }
    }
    Ok(Value::String(out))
}

/// Resolve one reference. `Ok(None)` means the expression is deferred and the
/// caller should keep the raw text in place.
fn resolve_reference(
    path: &[String],
    raw: &str,
    context: &TemplateContext,
    pass: TemplatePass,
    trail: &mut Vec<String>,
    unresolved: &mut Vec<String>,
) -> GardenResult<Option<Value>> {
    let is_runtime = path.first().map(String::as_str) == Some("runtime");

    // Runtime values do not exist until just before handler invocation
    if is_runtime && pass == TemplatePass::Static {
        trace!(expression = raw, "deferring runtime reference to runtime pass");
        return Ok(None);
    }

    let dotted = path.join(".");
    if trail.contains(&dotted) {
        let mut chain = trail.clone();
        chain.push(dotted.clone());
        return Err(GardenError::Template {
            message: format!("circular template reference: {}", raw),
            expression: Some(raw.to_string()),
            trail: chain,
            hint: Some("one of the referenced keys refers back to itself".to_string()),
        });
    }

    let found = match context.get_path(path) {
        Some(v) => v.clone(),
        None => {
            if is_runtime {
                unresolved.push(raw.to_string());
                return Ok(None);
            }
            return Err(GardenError::Template {
                message: format!("could not resolve reference {}", raw),
                expression: Some(raw.to_string()),
                trail: trail.clone(),
                hint: Some(format!(
                    "no value is configured under '{}'; check the key for typos",
                    dotted
                )),
            });
        }
    };

    // The referenced value may itself contain references
    trail.push(dotted);
    let resolved = resolve_node(&found, context, pass, trail, unresolved);
    trail.pop();
    resolved.map(Some)
}

fn stringify_scalar(value: &Value, raw: &str, trail: &[String]) -> GardenResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        Value::Object(_) | Value::Array(_) => Err(GardenError::Template {
            message: format!(
                "reference {} resolves to a structured value and cannot be embedded in a string",
                raw
            ),
            expression: Some(raw.to_string()),
            trail: trail.to_vec(),
            hint: Some("use the reference as the entire field value instead".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.set_layer("project", json!({"name": "demo"}));
        ctx.set_layer("environment", json!({"name": "local"}));
        ctx.set_layer(
            "variables",
            json!({"replicas": 3, "region": "eu-west-1", "tags": {"team": "platform"}}),
        );
        ctx.set_layer("providers", json!({"test-a": {"outputs": {"foo": "bar"}}}));
        ctx.set_layer("modules", json!({"api": {"version": "v-0123456789"}}));
        ctx
    }

    #[test]
    fn whole_reference_keeps_json_type() {
        let r = resolve_string("${variables.replicas}", &context(), TemplatePass::Static).unwrap();
        assert_eq!(r.value, json!(3));
    }

    #[test]
    fn embedded_reference_stringifies() {
        let r = resolve_string(
            "api-${modules.api.version}-${variables.replicas}",
            &context(),
            TemplatePass::Static,
        )
        .unwrap();
        assert_eq!(r.value, json!("api-v-0123456789-3"));
    }

    #[test]
    fn embedded_object_is_type_mismatch() {
        let err = resolve_string("tags: ${variables.tags}", &context(), TemplatePass::Static)
            .unwrap_err();
        assert!(err.to_string().contains("structured value"));
    }

    #[test]
    fn unknown_reference_names_expression() {
        let err =
            resolve_string("${variables.missing}", &context(), TemplatePass::Static).unwrap_err();
        let detail = err.detail();
        assert!(detail.contains("${variables.missing}"), "{detail}");
    }

    #[test]
    fn static_pass_defers_runtime_references() {
        let r = resolve_string(
            "${runtime.services.db.outputs.host}",
            &context(),
            TemplatePass::Static,
        )
        .unwrap();
        assert_eq!(r.value, json!("${runtime.services.db.outputs.host}"));
        assert!(r.unresolved.is_empty());
    }

    #[test]
    fn runtime_pass_collects_unresolved_runtime_references() {
        let r = resolve_config(
            &json!({
                "a": "${runtime.services.db.outputs.host}",
                "b": "${runtime.tasks.seed.outputs.rows}",
            }),
            &context(),
            TemplatePass::Runtime,
        )
        .unwrap();
        assert_eq!(r.unresolved.len(), 2);
        assert!(r
            .unresolved
            .contains(&"${runtime.services.db.outputs.host}".to_string()));
    }

    #[test]
    fn runtime_pass_resolves_available_runtime_values() {
        let mut ctx = context();
        ctx.set_layer(
            "runtime",
            json!({"services": {"db": {"outputs": {"host": "10.0.0.1"}}}}),
        );
        let r = resolve_string(
            "${runtime.services.db.outputs.host}",
            &ctx,
            TemplatePass::Runtime,
        )
        .unwrap();
        assert_eq!(r.value, json!("10.0.0.1"));
        assert!(r.unresolved.is_empty());
    }

    #[test]
    fn chained_variable_references_resolve() {
        let mut ctx = context();
        ctx.set_layer(
            "variables",
            json!({
                "base_host": "example.com",
                "api_host": "api.${variables.base_host}",
            }),
        );
        let r = resolve_string("${variables.api_host}", &ctx, TemplatePass::Static).unwrap();
        assert_eq!(r.value, json!("api.example.com"));
    }

    #[test]
    fn self_referential_variable_is_circular() {
        let mut ctx = context();
        ctx.set_layer(
            "variables",
            json!({"a": "${variables.b}", "b": "${variables.a}"}),
        );
        let err = resolve_string("${variables.a}", &ctx, TemplatePass::Static).unwrap_err();
        match err {
            GardenError::Template { message, trail, .. } => {
                assert!(message.contains("circular"), "{message}");
                assert_eq!(trail, vec!["variables.a", "variables.b", "variables.a"]);
            }
            other => panic!("expected template error, got {other:?}"),
        }
    }

    #[test]
    fn collect_references_walks_nested_config() {
        let refs = collect_references(&json!({
            "image": "${providers.test-a.outputs.foo}",
            "nested": {"list": ["${variables.region}", 42]},
        }));
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&vec![
            "providers".to_string(),
            "test-a".to_string(),
            "outputs".to_string(),
            "foo".to_string()
        ]));
    }
}
