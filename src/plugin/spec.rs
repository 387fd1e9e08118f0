//! Plugin descriptors as declared by plugin authors

use std::collections::BTreeMap;

use super::handler::{HandlerFn, ModuleAction, ProviderAction};
use crate::schema::Schema;

/// A module type created by a plugin
pub struct ModuleTypeDefinition {
    pub name: String,
    pub docs: String,
    pub schema: Option<Schema>,
    pub handlers: BTreeMap<ModuleAction, HandlerFn>,
}

impl ModuleTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: String::new(),
            schema: None,
            handlers: BTreeMap::new(),
        }
    }

    pub fn docs(mut self, text: impl Into<String>) -> Self {
        self.docs = text.into();
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn handler(mut self, action: ModuleAction, func: HandlerFn) -> Self {
        self.handlers.insert(action, func);
        self
    }
}

/// An extension of a module type created elsewhere. Extending requires a
/// declared dependency on the creating plugin.
pub struct ModuleTypeExtension {
    pub name: String,
    pub schema: Option<Schema>,
    pub handlers: BTreeMap<ModuleAction, HandlerFn>,
}

impl ModuleTypeExtension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            handlers: BTreeMap::new(),
        }
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn handler(mut self, action: ModuleAction, func: HandlerFn) -> Self {
        self.handlers.insert(action, func);
        self
    }
}

/// A named command a plugin exposes under `garden plugins <plugin> <command>`
pub struct PluginCommand {
    pub name: String,
    pub description: String,
    pub handler: HandlerFn,
}

/// A plugin as declared. The registry resolves these into flattened
/// [`super::ResolvedPlugin`]s.
pub struct PluginSpec {
    pub name: String,
    pub base: Option<String>,
    pub dependencies: Vec<String>,
    pub config_schema: Option<Schema>,
    pub handlers: BTreeMap<ProviderAction, HandlerFn>,
    pub create_module_types: Vec<ModuleTypeDefinition>,
    pub extend_module_types: Vec<ModuleTypeExtension>,
    pub commands: Vec<PluginCommand>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            dependencies: Vec::new(),
            config_schema: None,
            handlers: BTreeMap::new(),
            create_module_types: Vec::new(),
            extend_module_types: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn config_schema(mut self, schema: Schema) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn handler(mut self, action: ProviderAction, func: HandlerFn) -> Self {
        self.handlers.insert(action, func);
        self
    }

    pub fn create_module_type(mut self, definition: ModuleTypeDefinition) -> Self {
        self.create_module_types.push(definition);
        self
    }

    pub fn extend_module_type(mut self, extension: ModuleTypeExtension) -> Self {
        self.extend_module_types.push(extension);
        self
    }

    pub fn command(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: HandlerFn,
    ) -> Self {
        self.commands.push(PluginCommand {
            name: name.into(),
            description: description.into(),
            handler,
        });
        self
    }
}
