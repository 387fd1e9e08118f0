//! Module resolution pipeline
//!
//! Turns raw module documents into [`Module`]s: remote-source relocation,
//! the static template pass, schema validation against the creating plugin
//! (and every extension), the plugin `configure` step, and version
//! assignment. Modules are processed in build-dependency order so a module
//! can reference `${modules.<dep>.version}` and friends.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::discovery::RawModule;
use super::document::{BuildDependencyDoc, EntityDocument, ModuleDocument, MODULE_KIND};
use super::module::{
    BuildConfig, BuildDependency, CopySpec, Module, ModuleConfig, ServiceConfig, TaskConfig,
    TestConfig,
};
use crate::error::{GardenError, GardenResult};
use crate::plugin::{handler, ActionRouter, ModuleAction, PluginRegistry};
use crate::process::CancelToken;
use crate::schema::validate_all;
use crate::store::ConfigStore;
use crate::template::{resolve_config, TemplateContext, TemplatePass};
use crate::vcs::{FileFilter, RemoteSourceKind, RemoteSourceSpec, VcsHandler};
use crate::version::compute_module_version;

pub struct ModuleResolver<'a> {
    pub router: &'a ActionRouter,
    pub registry: &'a PluginRegistry,
    pub vcs: &'a dyn VcsHandler,
    pub store: &'a ConfigStore,
    /// Project, environment, variables and provider layers
    pub base_context: &'a TemplateContext,
    pub ignore_patterns: &'a [String],
    /// `<cache>/sources/`
    pub sources_dir: PathBuf,
}

/// Name and build-dependency skeleton, readable before template resolution
struct Skeleton {
    name: String,
    dependency_names: Vec<String>,
    repository_url: Option<String>,
    raw: RawModule,
}

impl ModuleResolver<'_> {
    pub async fn resolve(&self, raw_modules: Vec<RawModule>) -> GardenResult<Vec<Module>> {
        let skeletons = self.parse_skeletons(raw_modules)?;
        let order = sort_by_build_dependencies(&skeletons)?;

        let mut context = self.base_context.clone();
        let mut modules_layer = Map::new();
        let mut versions: BTreeMap<String, String> = BTreeMap::new();
        let mut resolved: BTreeMap<String, Module> = BTreeMap::new();

        for name in order {
            let skeleton = skeletons.iter().find(|s| s.name == name).unwrap();
            context.set_layer("modules", Value::Object(modules_layer.clone()));
            let module = self.resolve_one(skeleton, &context, &versions).await?;

            versions.insert(name.clone(), module.version.version_string.clone());
            modules_layer.insert(
                name.clone(),
                json!({
                    "version": module.version.version_string,
                    "path": module.config.path.display().to_string(),
                    "outputs": module.config.outputs,
                }),
            );
            resolved.insert(name, module);
        }

        Ok(resolved.into_values().collect())
    }

    fn parse_skeletons(&self, raw_modules: Vec<RawModule>) -> GardenResult<Vec<Skeleton>> {
        let mut skeletons: Vec<Skeleton> = Vec::new();
        for raw in raw_modules {
            let name = raw
                .value
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GardenError::config_at(
                        "module document is missing a literal `name`",
                        raw.config_path.display().to_string(),
                    )
                    .with_hint("module names cannot be template strings")
                })?
                .to_string();

            if let Some(existing) = skeletons.iter().find(|s| s.name == name) {
                return Err(GardenError::config(format!(
                    "module '{}' is declared twice: in {} and {}",
                    name,
                    existing.raw.config_path.display(),
                    raw.config_path.display()
                )));
            }

            let dependency_names = raw
                .value
                .get("build")
                .and_then(|b| b.get("dependencies"))
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| match d {
                            Value::String(s) => Some(s.clone()),
                            Value::Object(o) => {
                                o.get("name").and_then(Value::as_str).map(String::from)
                            }
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let repository_url = raw
                .value
                .get("repositoryUrl")
                .and_then(Value::as_str)
                .map(String::from);

            skeletons.push(Skeleton {
                name,
                dependency_names,
                repository_url,
                raw,
            });
        }
        Ok(skeletons)
    }

    async fn resolve_one(
        &self,
        skeleton: &Skeleton,
        context: &TemplateContext,
        versions: &BTreeMap<String, String>,
    ) -> GardenResult<Module> {
        let config_path = &skeleton.raw.config_path;

        // Remote modules live in the source cache unless linked locally
        let module_dir = match &skeleton.repository_url {
            None => skeleton.raw.dir.clone(),
            Some(url) => match self.store.linked_module_path(&skeleton.name) {
                Some(linked) => linked.to_path_buf(),
                None => {
                    self.vcs
                        .ensure_remote_source(&RemoteSourceSpec {
                            name: skeleton.name.clone(),
                            url: url.clone(),
                            kind: RemoteSourceKind::Module,
                            sources_dir: self.sources_dir.clone(),
                        })
                        .await?
                }
            },
        };

        let resolution = resolve_config(&skeleton.raw.value, context, TemplatePass::Static)
            .map_err(|e| annotate_path(e, config_path))?;
        let document = ModuleDocument::deserialize(resolution.value).map_err(|e| {
            GardenError::config_at(
                format!("invalid Module document: {}", e),
                config_path.display().to_string(),
            )
        })?;
        if document.kind != MODULE_KIND {
            return Err(GardenError::config_at(
                format!("expected kind 'Module', found '{}'", document.kind),
                config_path.display().to_string(),
            ));
        }
        if document.name != skeleton.name {
            return Err(GardenError::config_at(
                "module names cannot be template strings",
                config_path.display().to_string(),
            ));
        }

        let mut config = self.into_config(document, module_dir, config_path.clone())?;

        // Local modules run in place; copying build artifacts into them is
        // contradictory and rejected outright
        if config.local {
            let offending: Vec<&str> = config
                .build
                .dependencies
                .iter()
                .filter(|d| !d.copy.is_empty())
                .map(|d| d.name.as_str())
                .collect();
            if !offending.is_empty() {
                return Err(GardenError::config_at(
                    format!(
                        "local module '{}' may not declare `copy` on build dependencies: {}",
                        config.name,
                        offending.join(", ")
                    ),
                    config_path.display().to_string(),
                )
                .with_hint("remove the copy directives or unset `local`"));
            }
        }

        // Validate the spec against the creator's schema, then each extension
        let (_, created) = self.registry.module_type(&config.type_name)?;
        let mut schemas: Vec<&crate::schema::Schema> = created.schemas.iter().collect();
        let extensions = self.registry.extensions_of(&config.type_name);
        for extension in &extensions {
            if let Some(schema) = &extension.schema {
                schemas.push(schema);
            }
        }
        config.spec = validate_all(
            &config.spec,
            schemas,
            &format!("module '{}' ({})", config.name, config.type_name),
        )?;

        self.configure(&mut config, context).await?;

        let filter = FileFilter {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            ignore: self.ignore_patterns.to_vec(),
        };
        let files = self.vcs.tracked_files(&config.path, &filter).await?;

        let mut dependency_versions = BTreeMap::new();
        for dep in &config.build.dependencies {
            let version = versions.get(&dep.name).ok_or_else(|| {
                GardenError::dependency(format!(
                    "module '{}' declares a build dependency on unknown module '{}'",
                    config.name, dep.name
                ))
            })?;
            dependency_versions.insert(dep.name.clone(), version.clone());
        }

        let version = compute_module_version(&config.path, &files, &dependency_versions).await?;
        Ok(Module { config, version })
    }

    fn into_config(
        &self,
        document: ModuleDocument,
        path: PathBuf,
        config_path: PathBuf,
    ) -> GardenResult<ModuleConfig> {
        let dependencies = document
            .build
            .dependencies
            .into_iter()
            .map(|dep| match dep {
                BuildDependencyDoc::Name(name) => BuildDependency { name, copy: vec![] },
                BuildDependencyDoc::Full { name, copy } => BuildDependency {
                    name,
                    copy: copy
                        .into_iter()
                        .map(|c| {
                            let target = c.target.unwrap_or_else(|| c.source.clone());
                            CopySpec {
                                source: c.source,
                                target,
                            }
                        })
                        .collect(),
                },
            })
            .collect();

        Ok(ModuleConfig {
            api_version: document.api_version,
            type_name: document.type_name,
            name: document.name,
            path,
            config_path,
            description: document.description,
            include: document.include,
            exclude: document.exclude,
            repository_url: document.repository_url,
            allow_publish: document.allow_publish,
            local: document.local,
            build: BuildConfig {
                dependencies,
                command: document.build.command,
            },
            env: document.env,
            spec: document.spec,
            service_configs: Vec::new(),
            task_configs: document.tasks.iter().map(entity_to_task).collect(),
            test_configs: document.tests.iter().map(entity_to_test).collect(),
            outputs: Map::new(),
        })
    }

    /// Run the plugin's `configure` handler. The handler may rewrite the spec
    /// and contribute service/task/test configs; anything it leaves out is
    /// kept as-is.
    async fn configure(
        &self,
        config: &mut ModuleConfig,
        context: &TemplateContext,
    ) -> GardenResult<()> {
        let slot = self.router.module_handler(
            &config.type_name,
            ModuleAction::Configure,
            Some(handler(|_| async { Ok(json!({})) })),
        )?;

        let mut params = crate::plugin::ActionParams::new(self.router.context().clone());
        params.spec = config.spec.clone();
        params.args = json!({
            "name": config.name,
            "type": config.type_name,
            "path": config.path.display().to_string(),
            "local": config.local,
            "taskConfigs": config.task_configs.iter().map(task_to_value).collect::<Vec<_>>(),
            "testConfigs": config.test_configs.iter().map(test_to_value).collect::<Vec<_>>(),
        });
        params.cancel = CancelToken::never();

        let raw = slot.call(params).await.map_err(|e| {
            GardenError::config_at(
                format!("configure handler for module '{}' failed: {}", config.name, e),
                config.config_path.display().to_string(),
            )
        })?;

        let result = ConfigureResult::deserialize(raw).map_err(|e| {
            GardenError::plugin(format!(
                "configure handler for module '{}' returned an invalid result: {}",
                config.name, e
            ))
        })?;

        if let Some(spec) = result.spec {
            // Handler-synthesized config may carry fresh template strings
            let resolution = resolve_config(&spec, context, TemplatePass::Static)?;
            config.spec = resolution.value;
        }
        if let Some(services) = result.service_configs {
            config.service_configs = services.into_iter().map(EntityOut::into_service).collect();
        }
        if let Some(tasks) = result.task_configs {
            config.task_configs = tasks.into_iter().map(EntityOut::into_task).collect();
        }
        if let Some(tests) = result.test_configs {
            config.test_configs = tests.into_iter().map(EntityOut::into_test).collect();
        }
        if let Some(outputs) = result.outputs {
            config.outputs = outputs;
        }
        Ok(())
    }
}

fn annotate_path(err: GardenError, config_path: &std::path::Path) -> GardenError {
    match err {
        GardenError::Template {
            message,
            expression,
            trail,
            hint,
        } => GardenError::Template {
            message: format!("{} (in {})", message, config_path.display()),
            expression,
            trail,
            hint,
        },
        other => other,
    }
}

/// Modules ordered so every build dependency precedes its dependents
fn sort_by_build_dependencies(skeletons: &[Skeleton]) -> GardenResult<Vec<String>> {
    let known: BTreeSet<&str> = skeletons.iter().map(|s| s.name.as_str()).collect();
    let mut order = Vec::with_capacity(skeletons.len());
    let mut done: BTreeSet<String> = BTreeSet::new();
    let mut visiting: Vec<String> = Vec::new();

    fn visit(
        name: &str,
        skeletons: &[Skeleton],
        known: &BTreeSet<&str>,
        done: &mut BTreeSet<String>,
        visiting: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> GardenResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(at) = visiting.iter().position(|n| n == name) {
            let mut chain = visiting[at..].to_vec();
            chain.push(name.to_string());
            return Err(GardenError::cycle("circular build dependencies", &chain));
        }
        visiting.push(name.to_string());
        let skeleton = skeletons.iter().find(|s| s.name == name).unwrap();
        for dep in &skeleton.dependency_names {
            if known.contains(dep.as_str()) {
                visit(dep, skeletons, known, done, visiting, order)?;
            }
            // Unknown dependency names surface during version computation
            // with a proper error; don't fail the sort here
        }
        visiting.pop();
        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    let mut names: Vec<&str> = skeletons.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    for name in names {
        visit(name, skeletons, &known, &mut done, &mut visiting, &mut order)?;
    }
    Ok(order)
}

fn entity_to_task(doc: &EntityDocument) -> TaskConfig {
    TaskConfig {
        name: doc.name.clone(),
        dependencies: doc.dependencies.clone(),
        env: doc.env.clone(),
        timeout: doc.timeout,
        spec: Value::Object(doc.spec.clone()),
    }
}

fn entity_to_test(doc: &EntityDocument) -> TestConfig {
    TestConfig {
        name: doc.name.clone(),
        dependencies: doc.dependencies.clone(),
        env: doc.env.clone(),
        timeout: doc.timeout,
        spec: Value::Object(doc.spec.clone()),
    }
}

fn task_to_value(task: &TaskConfig) -> Value {
    json!({
        "name": task.name,
        "dependencies": task.dependencies,
        "env": task.env,
        "timeout": task.timeout,
        "spec": task.spec,
    })
}

fn test_to_value(test: &TestConfig) -> Value {
    json!({
        "name": test.name,
        "dependencies": test.dependencies,
        "env": test.env,
        "timeout": test.timeout,
        "spec": test.spec,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigureResult {
    spec: Option<Value>,
    service_configs: Option<Vec<EntityOut>>,
    task_configs: Option<Vec<EntityOut>>,
    test_configs: Option<Vec<EntityOut>>,
    outputs: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityOut {
    name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    spec: Value,
}

impl EntityOut {
    fn into_service(self) -> ServiceConfig {
        ServiceConfig {
            name: self.name,
            dependencies: self.dependencies,
            env: self.env,
            spec: self.spec,
        }
    }

    fn into_task(self) -> TaskConfig {
        TaskConfig {
            name: self.name,
            dependencies: self.dependencies,
            env: self.env,
            timeout: self.timeout,
            spec: self.spec,
        }
    }

    fn into_test(self) -> TestConfig {
        TestConfig {
            name: self.name,
            dependencies: self.dependencies,
            env: self.env,
            timeout: self.timeout,
            spec: self.spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        ActionContext, ActionParams, ModuleTypeDefinition, PluginSpec,
    };
    use crate::schema::Schema;
    use crate::store::{ConfigStore, CONFIG_STORE_FILENAME};
    use crate::vcs::WorkspaceVcs;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn exec_registry() -> Arc<PluginRegistry> {
        Arc::new(
            PluginRegistry::resolve(vec![PluginSpec::new("test-plugin").create_module_type(
                ModuleTypeDefinition::new("exec")
                    .schema(Schema::object([(
                        "services",
                        Schema::array(Schema::object([("name", Schema::string().required())])),
                    )]))
                    .handler(
                        ModuleAction::Configure,
                        handler(|params: ActionParams| async move {
                            // Promote spec.services entries to service configs
                            let services = params
                                .spec
                                .get("services")
                                .and_then(Value::as_array)
                                .cloned()
                                .unwrap_or_default();
                            Ok(json!({ "serviceConfigs": services }))
                        }),
                    ),
            )])
            .unwrap(),
        )
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        registry: Arc<PluginRegistry>,
        store: ConfigStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        Fixture {
            store: ConfigStore::load(root.join(".garden").join(CONFIG_STORE_FILENAME)).unwrap(),
            registry: exec_registry(),
            root,
            _dir: dir,
        }
    }

    fn raw(fixture: &Fixture, dir: &str, yaml: &str) -> RawModule {
        let module_dir = fixture.root.join(dir);
        fs::create_dir_all(&module_dir).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        RawModule {
            value: serde_json::to_value(value).unwrap(),
            config_path: module_dir.join("garden.yml"),
            dir: module_dir,
        }
    }

    async fn resolve(fixture: &Fixture, raws: Vec<RawModule>) -> GardenResult<Vec<Module>> {
        let router = ActionRouter::new(fixture.registry.clone(), ActionContext::default());
        let mut context = TemplateContext::new();
        context.set_layer("project", json!({"name": "demo"}));
        context.set_layer("variables", json!({"region": "eu-west-1"}));
        let resolver = ModuleResolver {
            router: &router,
            registry: &fixture.registry,
            vcs: &WorkspaceVcs,
            store: &fixture.store,
            base_context: &context,
            ignore_patterns: &[],
            sources_dir: fixture.root.join(".garden").join("sources"),
        };
        resolver.resolve(raws).await
    }

    #[tokio::test]
    async fn resolves_templates_and_synthesizes_services() {
        let f = fixture();
        fs::write(f.root.join("api").join("main.sh"), "echo hi").ok();
        let modules = resolve(
            &f,
            vec![raw(
                &f,
                "api",
                r#"
kind: Module
type: exec
name: api
spec:
  services:
    - name: api
      region: "${variables.region}"
"#,
            )],
        )
        .await
        .unwrap();

        assert_eq!(modules.len(), 1);
        let module = &modules[0];
        assert_eq!(module.config.service_configs.len(), 1);
        assert_eq!(module.config.service_configs[0].name, "api");
        assert_eq!(
            module.config.service_configs[0].spec["region"],
            json!("eu-west-1")
        );
    }

    #[tokio::test]
    async fn duplicate_module_names_fail() {
        let f = fixture();
        let a = raw(&f, "one", "kind: Module\ntype: exec\nname: api\n");
        let b = raw(&f, "two", "kind: Module\ntype: exec\nname: api\n");
        let err = resolve(&f, vec![a, b]).await.unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{err}");
    }

    #[tokio::test]
    async fn dependency_version_feeds_dependent_version() {
        let f = fixture();
        fs::create_dir_all(f.root.join("a")).unwrap();
        fs::write(f.root.join("a").join("src.txt"), "one").unwrap();
        let make = |f: &Fixture| {
            vec![
                raw(f, "a", "kind: Module\ntype: exec\nname: a\n"),
                raw(
                    f,
                    "b",
                    "kind: Module\ntype: exec\nname: b\nbuild:\n  dependencies: [a]\n",
                ),
            ]
        };
        let before = resolve(&f, make(&f)).await.unwrap();
        fs::write(f.root.join("a").join("src.txt"), "two").unwrap();
        let after = resolve(&f, make(&f)).await.unwrap();

        let b_before = before.iter().find(|m| m.name() == "b").unwrap();
        let b_after = after.iter().find(|m| m.name() == "b").unwrap();
        assert_ne!(b_before.version.version_string, b_after.version.version_string);
        assert_eq!(
            b_after.version.dependency_versions.keys().collect::<Vec<_>>(),
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn dependents_can_reference_dependency_versions() {
        let f = fixture();
        let modules = resolve(
            &f,
            vec![
                raw(&f, "a", "kind: Module\ntype: exec\nname: a\n"),
                raw(
                    &f,
                    "b",
                    "kind: Module\ntype: exec\nname: b\nbuild:\n  dependencies: [a]\nspec:\n  tag: \"${modules.a.version}\"\n",
                ),
            ],
        )
        .await
        .unwrap();
        let a = modules.iter().find(|m| m.name() == "a").unwrap();
        let b = modules.iter().find(|m| m.name() == "b").unwrap();
        assert_eq!(b.config.spec["tag"], json!(a.version.version_string));
    }

    #[tokio::test]
    async fn local_module_rejects_copy_build_deps() {
        let f = fixture();
        let err = resolve(
            &f,
            vec![
                raw(&f, "lib", "kind: Module\ntype: exec\nname: lib\n"),
                raw(
                    &f,
                    "app",
                    r#"
kind: Module
type: exec
name: app
local: true
build:
  dependencies:
    - name: lib
      copy:
        - source: dist
"#,
                ),
            ],
        )
        .await
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("may not declare `copy`"), "{text}");
        assert!(text.contains("lib"), "{text}");
    }

    #[tokio::test]
    async fn build_dependency_cycle_names_the_chain() {
        let f = fixture();
        let err = resolve(
            &f,
            vec![
                raw(&f, "a", "kind: Module\ntype: exec\nname: a\nbuild:\n  dependencies: [b]\n"),
                raw(&f, "b", "kind: Module\ntype: exec\nname: b\nbuild:\n  dependencies: [a]\n"),
            ],
        )
        .await
        .unwrap_err();
        assert!(err.detail().contains("a <- b <- a"), "{}", err.detail());
    }

    #[tokio::test]
    async fn unknown_module_type_is_a_config_error() {
        let f = fixture();
        let err = resolve(
            &f,
            vec![raw(&f, "x", "kind: Module\ntype: mystery\nname: x\n")],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown module type 'mystery'"));
    }

    #[tokio::test]
    async fn spec_is_validated_against_plugin_schema() {
        let f = fixture();
        let err = resolve(
            &f,
            vec![raw(
                &f,
                "x",
                "kind: Module\ntype: exec\nname: x\nspec:\n  services:\n    - notName: oops\n",
            )],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("/services/0/name"), "{err}");
    }
}
