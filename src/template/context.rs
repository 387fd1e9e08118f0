//! Layered resolution context

use serde_json::{Map, Value};

/// The context tree a template resolves against.
///
/// Layers are plain JSON trees keyed by their top-level name (`project`,
/// `environment`, `variables`, `providers`, `modules`, `runtime`). Values
/// inside a layer may themselves be template strings; the resolver follows
/// them recursively with cycle detection.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a whole top-level layer
    pub fn set_layer(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_string(), value);
    }

    /// Look up a path, returning None when any key along the way is absent
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let mut current = self.root.get(path.first()?)?;
        for key in &path[1..] {
            match current {
                Value::Object(map) => current = map.get(key)?,
                Value::Array(items) => {
                    let index: usize = key.parse().ok()?;
                    current = items.get(index)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn layer(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }
}
