//! Plugin resolution
//!
//! Takes declared [`PluginSpec`]s and produces flattened [`ResolvedPlugin`]s:
//! `base` chains are collapsed into single handler tables (leaf wins, with
//! `base` links back up the chain), dependencies are merged and the whole set
//! is ordered topologically for initialization.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::handler::{ModuleAction, ProviderAction, ResolvedHandler};
use super::spec::PluginSpec;
use crate::error::{GardenError, GardenResult};
use crate::schema::Schema;

/// A module type after resolution, attributed to the plugin that declared it
#[derive(Clone)]
pub struct ResolvedModuleType {
    pub name: String,
    pub docs: String,
    /// The plugin that declared the type (possibly an ancestor of the plugin
    /// this instance was reached through)
    pub creator: String,
    /// Validation chain, creator's schema first
    pub schemas: Vec<Schema>,
    pub handlers: BTreeMap<ModuleAction, Arc<ResolvedHandler>>,
}

/// An extension of a module type created by another plugin
#[derive(Clone)]
pub struct ResolvedExtension {
    pub type_name: String,
    /// The plugin declaring the extension
    pub plugin_name: String,
    pub schema: Option<Schema>,
    pub handlers: BTreeMap<ModuleAction, Arc<ResolvedHandler>>,
}

#[derive(Clone)]
pub struct ResolvedCommand {
    pub description: String,
    pub handler: Arc<ResolvedHandler>,
}

/// A plugin with its full `base` chain flattened in
#[derive(Clone)]
pub struct ResolvedPlugin {
    pub name: String,
    pub base: Option<String>,
    /// Self first, then each base up to the root
    pub base_chain: Vec<String>,
    /// Merged across the chain, de-duplicated, stable-ordered (root first)
    pub dependencies: Vec<String>,
    /// Validation chain for provider configs, leaf schema first
    pub config_schemas: Vec<Schema>,
    pub handlers: BTreeMap<ProviderAction, Arc<ResolvedHandler>>,
    pub created_module_types: Vec<ResolvedModuleType>,
    pub extensions: Vec<ResolvedExtension>,
    pub commands: BTreeMap<String, ResolvedCommand>,
}

impl ResolvedPlugin {
    pub fn handler(&self, action: ProviderAction) -> Option<Arc<ResolvedHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn base_chain_contains(&self, name: &str) -> bool {
        self.base_chain.iter().any(|n| n == name)
    }
}

/// The resolved plugin set
pub struct PluginRegistry {
    plugins: BTreeMap<String, ResolvedPlugin>,
    /// Plugin names in dependency-topological order
    init_order: Vec<String>,
    /// Module type name -> creating plugin
    module_type_creators: BTreeMap<String, String>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("init_order", &self.init_order)
            .field("module_type_creators", &self.module_type_creators)
            .finish()
    }
}

impl PluginRegistry {
    pub fn resolve(specs: Vec<PluginSpec>) -> GardenResult<Self> {
        let mut by_name: BTreeMap<String, PluginSpec> = BTreeMap::new();
        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(GardenError::plugin_named(
                    spec.name.clone(),
                    format!("plugin '{}' is registered more than once", spec.name),
                ));
            }
            by_name.insert(spec.name.clone(), spec);
        }

        // Validate base chains up front so flattening can recurse freely
        for name in by_name.keys() {
            check_base_chain(name, &by_name)?;
        }

        // Module type creators come from *declarations*, before inheritance
        // spreads copies through the chains
        let mut module_type_creators: BTreeMap<String, String> = BTreeMap::new();
        for (name, spec) in &by_name {
            for definition in &spec.create_module_types {
                if let Some(existing) = module_type_creators.get(&definition.name) {
                    // Chain-internal redeclaration gets the more specific error
                    if chain_of(name, &by_name).contains(existing)
                        || chain_of(existing, &by_name).contains(name)
                    {
                        return Err(GardenError::plugin_named(
                            name.clone(),
                            format!(
                                "plugin '{}' redeclares module type '{}' already created by '{}' in its base chain",
                                name, definition.name, existing
                            ),
                        ));
                    }
                    return Err(GardenError::plugin(format!(
                        "module type '{}' is created by both '{}' and '{}'; a type may only have one creator",
                        definition.name, existing, name
                    ))
                    .with_hint("extend the existing type instead of creating it again"));
                }
                module_type_creators.insert(definition.name.clone(), name.clone());
            }
        }

        // Flatten each chain, root first so parents are available
        let mut plugins: BTreeMap<String, ResolvedPlugin> = BTreeMap::new();
        let names: Vec<String> = by_name.keys().cloned().collect();
        for name in &names {
            flatten(name, &by_name, &mut plugins)?;
        }

        // Extensions can only be validated once every creator is known
        for (name, spec) in &by_name {
            let resolved = &plugins[name];
            for extension in &spec.extend_module_types {
                let creator = module_type_creators.get(&extension.name).ok_or_else(|| {
                    GardenError::plugin_named(
                        name.clone(),
                        format!(
                            "plugin '{}' extends module type '{}', which no loaded plugin creates",
                            name, extension.name
                        ),
                    )
                    .with_hint("load the plugin that creates the type, or drop the extension")
                })?;
                let satisfied = creator == name
                    || resolved.base_chain_contains(creator)
                    || resolved.dependencies.iter().any(|dep| {
                        dep == creator
                            || plugins
                                .get(dep)
                                .map(|p| p.base_chain_contains(creator))
                                .unwrap_or(false)
                    });
                if !satisfied {
                    return Err(GardenError::plugin_named(
                        name.clone(),
                        format!(
                            "plugin '{}' extends module type '{}' but does not declare a dependency on its creator '{}'",
                            name, extension.name, creator
                        ),
                    )
                    .with_hint(format!("add '{}' to the plugin's dependencies", creator)));
                }
            }
        }

        // Give extension handlers a base link onto the creator's handler so
        // they can delegate
        let creator_types: BTreeMap<String, ResolvedModuleType> = plugins
            .values()
            .flat_map(|p| p.created_module_types.iter())
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        for plugin in plugins.values_mut() {
            for extension in &mut plugin.extensions {
                if let Some(created) = creator_types.get(&extension.type_name) {
                    for (action, slot) in extension.handlers.iter_mut() {
                        if slot.base.is_none() {
                            if let Some(below) = created.handlers.get(action) {
                                *slot = Arc::new(ResolvedHandler {
                                    plugin_name: slot.plugin_name.clone(),
                                    func: slot.func.clone(),
                                    base: Some(below.clone()),
                                });
                            }
                        }
                    }
                }
            }
        }

        let init_order = topo_sort(&plugins)?;

        Ok(Self {
            plugins,
            init_order,
            module_type_creators,
        })
    }

    pub fn get(&self, name: &str) -> GardenResult<&ResolvedPlugin> {
        self.plugins.get(name).ok_or_else(|| {
            GardenError::plugin(format!("plugin '{}' is not registered", name))
                .with_hint("check the provider name against the loaded plugins")
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn init_order(&self) -> &[String] {
        &self.init_order
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// The plugin creating a module type, plus the resolved type
    pub fn module_type(&self, type_name: &str) -> GardenResult<(&ResolvedPlugin, &ResolvedModuleType)> {
        let creator = self.module_type_creators.get(type_name).ok_or_else(|| {
            GardenError::config(format!("unknown module type '{}'", type_name)).with_hint(
                "make sure the plugin that provides this type is configured in the project",
            )
        })?;
        let plugin = self.get(creator)?;
        let created = plugin
            .created_module_types
            .iter()
            .find(|t| t.name == type_name)
            .ok_or_else(|| {
                GardenError::internal(format!(
                    "module type index points at '{}' but the type is missing there",
                    creator
                ))
            })?;
        Ok((plugin, created))
    }

    /// Extensions of a type, in plugin init order
    pub fn extensions_of(&self, type_name: &str) -> Vec<&ResolvedExtension> {
        let mut out = Vec::new();
        for name in &self.init_order {
            if let Some(plugin) = self.plugins.get(name) {
                for extension in &plugin.extensions {
                    if extension.type_name == type_name && extension.plugin_name == *name {
                        out.push(extension);
                    }
                }
            }
        }
        out
    }
}

fn chain_of(name: &str, specs: &BTreeMap<String, PluginSpec>) -> Vec<String> {
    let mut chain = vec![name.to_string()];
    let mut current = name;
    while let Some(base) = specs.get(current).and_then(|s| s.base.as_deref()) {
        if chain.iter().any(|n| n == base) {
            break;
        }
        chain.push(base.to_string());
        current = base;
    }
    chain
}

fn check_base_chain(name: &str, specs: &BTreeMap<String, PluginSpec>) -> GardenResult<()> {
    let mut seen = vec![name.to_string()];
    let mut current = name;
    while let Some(base) = specs.get(current).and_then(|s| s.base.as_deref()) {
        if !specs.contains_key(base) {
            return Err(GardenError::plugin_named(
                current.to_string(),
                format!(
                    "plugin '{}' specifies base '{}', which is not registered",
                    current, base
                ),
            )
            .with_hint("register the base plugin even if it is not configured as a provider"));
        }
        if seen.iter().any(|n| n == base) {
            let mut chain = seen.clone();
            chain.push(base.to_string());
            return Err(GardenError::cycle("circular plugin base chain", &chain));
        }
        seen.push(base.to_string());
        current = base;
    }
    Ok(())
}

/// Flatten `name`'s base chain into a [`ResolvedPlugin`], memoized
fn flatten(
    name: &str,
    specs: &BTreeMap<String, PluginSpec>,
    resolved: &mut BTreeMap<String, ResolvedPlugin>,
) -> GardenResult<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    let spec = &specs[name];

    let parent = match &spec.base {
        Some(base) => {
            flatten(base, specs, resolved)?;
            Some(resolved[base].clone())
        }
        None => None,
    };

    let mut base_chain = vec![name.to_string()];
    let mut dependencies = Vec::new();
    let mut config_schemas = Vec::new();
    let mut handlers: BTreeMap<ProviderAction, Arc<ResolvedHandler>> = BTreeMap::new();
    let mut created_module_types = Vec::new();
    let mut extensions = Vec::new();
    let mut commands: BTreeMap<String, ResolvedCommand> = BTreeMap::new();

    if let Some(parent) = &parent {
        base_chain.extend(parent.base_chain.iter().cloned());
        dependencies.extend(parent.dependencies.iter().cloned());
        handlers.extend(parent.handlers.clone());
        created_module_types.extend(parent.created_module_types.iter().cloned());
        extensions.extend(parent.extensions.iter().cloned());
        commands.extend(parent.commands.clone());
    }

    for dep in &spec.dependencies {
        if !dependencies.contains(dep) {
            dependencies.push(dep.clone());
        }
    }

    if let Some(schema) = &spec.config_schema {
        config_schemas.push(schema.clone());
    }
    if let Some(parent) = &parent {
        config_schemas.extend(parent.config_schemas.iter().cloned());
    }

    // Leaf handler wins; the slot it replaces becomes its `base`
    for (action, func) in &spec.handlers {
        let below = handlers.get(action).cloned();
        handlers.insert(
            *action,
            Arc::new(ResolvedHandler {
                plugin_name: name.to_string(),
                func: func.clone(),
                base: below,
            }),
        );
    }

    for command in &spec.commands {
        let below = commands.get(&command.name).map(|c| c.handler.clone());
        commands.insert(
            command.name.clone(),
            ResolvedCommand {
                description: command.description.clone(),
                handler: Arc::new(ResolvedHandler {
                    plugin_name: name.to_string(),
                    func: command.handler.clone(),
                    base: below,
                }),
            },
        );
    }

    for definition in &spec.create_module_types {
        created_module_types.push(ResolvedModuleType {
            name: definition.name.clone(),
            docs: definition.docs.clone(),
            creator: name.to_string(),
            schemas: definition.schema.iter().cloned().collect(),
            handlers: definition
                .handlers
                .iter()
                .map(|(action, func)| {
                    (
                        *action,
                        Arc::new(ResolvedHandler {
                            plugin_name: name.to_string(),
                            func: func.clone(),
                            base: None,
                        }),
                    )
                })
                .collect(),
        });
    }

    for extension in &spec.extend_module_types {
        extensions.push(ResolvedExtension {
            type_name: extension.name.clone(),
            plugin_name: name.to_string(),
            schema: extension.schema.clone(),
            handlers: extension
                .handlers
                .iter()
                .map(|(action, func)| {
                    (
                        *action,
                        Arc::new(ResolvedHandler {
                            plugin_name: name.to_string(),
                            func: func.clone(),
                            base: None,
                        }),
                    )
                })
                .collect(),
        });
    }

    resolved.insert(
        name.to_string(),
        ResolvedPlugin {
            name: name.to_string(),
            base: spec.base.clone(),
            base_chain,
            dependencies,
            config_schemas,
            handlers,
            created_module_types,
            extensions,
            commands,
        },
    );
    Ok(())
}

/// Kahn's algorithm over merged dependencies; deterministic tie-break by name
fn topo_sort(plugins: &BTreeMap<String, ResolvedPlugin>) -> GardenResult<Vec<String>> {
    for plugin in plugins.values() {
        for dep in &plugin.dependencies {
            if !plugins.contains_key(dep) {
                return Err(GardenError::plugin_named(
                    plugin.name.clone(),
                    format!(
                        "plugin '{}' depends on '{}', which is not registered",
                        plugin.name, dep
                    ),
                ));
            }
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = plugins.keys().map(|n| (n.as_str(), 0)).collect();
    for plugin in plugins.values() {
        let unique: BTreeSet<&str> = plugin.dependencies.iter().map(String::as_str).collect();
        *in_degree.get_mut(plugin.name.as_str()).unwrap() += unique.len();
    }

    let mut order = Vec::with_capacity(plugins.len());
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(next);
        order.push(next.to_string());
        for plugin in plugins.values() {
            if plugin.dependencies.iter().any(|d| d == next) {
                let degree = in_degree.get_mut(plugin.name.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(plugin.name.as_str());
                }
            }
        }
    }

    if order.len() < plugins.len() {
        let remaining: Vec<&str> = plugins
            .keys()
            .map(String::as_str)
            .filter(|n| !order.iter().any(|o| o == n))
            .collect();
        let chain = find_dependency_cycle(plugins, &remaining);
        return Err(GardenError::cycle("circular plugin dependencies", &chain));
    }
    Ok(order)
}

/// Walk the leftover subgraph until a node repeats, to name the cycle
fn find_dependency_cycle(
    plugins: &BTreeMap<String, ResolvedPlugin>,
    remaining: &[&str],
) -> Vec<String> {
    let mut path: Vec<String> = Vec::new();
    let mut current = remaining[0];
    loop {
        if let Some(at) = path.iter().position(|n| n == current) {
            let mut chain = path[at..].to_vec();
            chain.push(current.to_string());
            return chain;
        }
        path.push(current.to_string());
        current = plugins[current]
            .dependencies
            .iter()
            .map(String::as_str)
            .find(|d| remaining.contains(d))
            .unwrap_or(remaining[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handler::{handler, ActionContext, ActionParams, ModuleAction};
    use crate::plugin::spec::{ModuleTypeDefinition, ModuleTypeExtension};
    use serde_json::json;

    fn noop() -> crate::plugin::handler::HandlerFn {
        handler(|_| async { Ok(json!({})) })
    }

    fn tagged(tag: &'static str) -> crate::plugin::handler::HandlerFn {
        handler(move |_| async move { Ok(json!({ "from": tag })) })
    }

    #[test]
    fn leaf_handler_wins_with_super_chain() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("root")
                .handler(ProviderAction::GetEnvironmentStatus, tagged("root")),
            PluginSpec::new("mid")
                .base("root")
                .handler(ProviderAction::GetEnvironmentStatus, tagged("mid")),
            PluginSpec::new("leaf").base("mid"),
        ])
        .unwrap();

        let leaf = registry.get("leaf").unwrap();
        let slot = leaf.handler(ProviderAction::GetEnvironmentStatus).unwrap();
        // Inherited from mid, which overrode root
        assert_eq!(slot.plugin_name, "mid");
        assert_eq!(slot.chain_len(), 2);
        assert_eq!(slot.base.as_ref().unwrap().plugin_name, "root");
        assert_eq!(leaf.base_chain, vec!["leaf", "mid", "root"]);
    }

    #[tokio::test]
    async fn overriding_handler_can_delegate() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("root")
                .handler(ProviderAction::GetEnvironmentStatus, tagged("root")),
            PluginSpec::new("leaf").base("root").handler(
                ProviderAction::GetEnvironmentStatus,
                handler(|params: ActionParams| async move {
                    let below = params.base.expect("no base link");
                    let inner = below.call(ActionParams::new(params.ctx.clone())).await?;
                    Ok(json!({"inner": inner, "from": "leaf"}))
                }),
            ),
        ])
        .unwrap();

        let slot = registry
            .get("leaf")
            .unwrap()
            .handler(ProviderAction::GetEnvironmentStatus)
            .unwrap();
        let out = slot.call(ActionParams::new(ActionContext::default())).await.unwrap();
        assert_eq!(out["from"], json!("leaf"));
        assert_eq!(out["inner"]["from"], json!("root"));
    }

    #[test]
    fn missing_base_is_reported() {
        let err = PluginRegistry::resolve(vec![PluginSpec::new("a").base("ghost")]).unwrap_err();
        assert!(err.to_string().contains("base 'ghost'"));
    }

    #[test]
    fn circular_bases_report_full_path() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("a").base("b"),
            PluginSpec::new("b").base("a"),
        ])
        .unwrap_err();
        assert!(err.detail().contains("a <- b <- a"), "{}", err.detail());
    }

    #[test]
    fn dependencies_merge_across_chain() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("util"),
            PluginSpec::new("extra"),
            PluginSpec::new("root").dependency("util"),
            PluginSpec::new("leaf")
                .base("root")
                .dependency("extra")
                .dependency("util"),
        ])
        .unwrap();
        assert_eq!(
            registry.get("leaf").unwrap().dependencies,
            vec!["util".to_string(), "extra".to_string()]
        );
    }

    #[test]
    fn circular_dependencies_report_full_path() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("a").dependency("b"),
            PluginSpec::new("b").dependency("a"),
        ])
        .unwrap_err();
        assert!(err.detail().contains("<-"), "{}", err.detail());
    }

    #[test]
    fn init_order_follows_dependencies() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("c").dependency("b"),
            PluginSpec::new("b").dependency("a"),
            PluginSpec::new("a"),
        ])
        .unwrap();
        assert_eq!(registry.init_order(), ["a", "b", "c"]);
    }

    #[test]
    fn module_type_has_one_creator() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("one").create_module_type(ModuleTypeDefinition::new("exec")),
            PluginSpec::new("two").create_module_type(ModuleTypeDefinition::new("exec")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("one creator"), "{err}");
    }

    #[test]
    fn redeclaring_ancestor_type_is_rejected() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("root").create_module_type(ModuleTypeDefinition::new("exec")),
            PluginSpec::new("leaf")
                .base("root")
                .create_module_type(ModuleTypeDefinition::new("exec")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("redeclares"), "{err}");
    }

    #[test]
    fn created_types_are_inherited_through_the_chain() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("root").create_module_type(
                ModuleTypeDefinition::new("exec").handler(ModuleAction::Build, noop()),
            ),
            PluginSpec::new("leaf").base("root"),
        ])
        .unwrap();
        let (creator_plugin, created) = registry.module_type("exec").unwrap();
        assert_eq!(creator_plugin.name, "root");
        assert_eq!(created.creator, "root");
        assert!(registry
            .get("leaf")
            .unwrap()
            .created_module_types
            .iter()
            .any(|t| t.name == "exec"));
    }

    #[test]
    fn extending_unknown_type_is_rejected() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("a").extend_module_type(ModuleTypeExtension::new("ghost")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("no loaded plugin creates"), "{err}");
    }

    #[test]
    fn extension_requires_dependency_on_creator() {
        let err = PluginRegistry::resolve(vec![
            PluginSpec::new("creator").create_module_type(ModuleTypeDefinition::new("exec")),
            PluginSpec::new("extender").extend_module_type(ModuleTypeExtension::new("exec")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("does not declare a dependency"), "{err}");
    }

    #[test]
    fn extension_through_dependency_base_chain_is_allowed() {
        // extender depends on `wrapper`, whose base chain contains the creator
        PluginRegistry::resolve(vec![
            PluginSpec::new("creator").create_module_type(ModuleTypeDefinition::new("exec")),
            PluginSpec::new("wrapper").base("creator"),
            PluginSpec::new("extender")
                .dependency("wrapper")
                .extend_module_type(ModuleTypeExtension::new("exec")),
        ])
        .unwrap();
    }

    #[test]
    fn extension_handler_gets_base_link_to_creator() {
        let registry = PluginRegistry::resolve(vec![
            PluginSpec::new("creator").create_module_type(
                ModuleTypeDefinition::new("exec").handler(ModuleAction::Build, tagged("creator")),
            ),
            PluginSpec::new("extender")
                .dependency("creator")
                .extend_module_type(
                    ModuleTypeExtension::new("exec").handler(ModuleAction::Build, tagged("ext")),
                ),
        ])
        .unwrap();
        let extension = &registry.extensions_of("exec")[0];
        let slot = extension.handlers.get(&ModuleAction::Build).unwrap();
        assert_eq!(slot.plugin_name, "extender");
        assert_eq!(slot.base.as_ref().unwrap().plugin_name, "creator");
    }
}
