//! The config graph
//!
//! A queryable view over every module, service, task and test in the
//! project, with typed dependency edges. The graph is validated eagerly on
//! construction: unknown references and cycles fail load before any work
//! begins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::config::module::Module;
use crate::error::{GardenError, GardenResult};

/// Edge labels. An edge carries the kind of the depending entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    Build,
    Service,
    Task,
    Test,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::Service => "service",
            Self::Task => "task",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// A node in the config graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityRef {
    Module(String),
    Service(String),
    Task(String),
    Test { module: String, name: String },
}

impl EntityRef {
    pub fn test(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Test {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Stable key, e.g. `module.api`, `test.api.unit`
    pub fn key(&self) -> String {
        match self {
            Self::Module(n) => format!("module.{}", n),
            Self::Service(n) => format!("service.{}", n),
            Self::Task(n) => format!("task.{}", n),
            Self::Test { module, name } => format!("test.{}.{}", module, name),
        }
    }

    /// The short name used in cycle and error messages
    pub fn display_name(&self) -> String {
        match self {
            Self::Module(n) | Self::Service(n) | Self::Task(n) => n.clone(),
            Self::Test { module, name } => format!("{}.{}", module, name),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(n) => write!(f, "module '{}'", n),
            Self::Service(n) => write!(f, "service '{}'", n),
            Self::Task(n) => write!(f, "task '{}'", n),
            Self::Test { module, name } => write!(f, "test '{}' in module '{}'", name, module),
        }
    }
}

#[derive(Debug, Clone)]
struct Edge {
    kind: DependencyKind,
    to: EntityRef,
}

/// Module/service/task/test graph with typed dependency edges
#[derive(Debug)]
pub struct ConfigGraph {
    modules: BTreeMap<String, Arc<Module>>,
    /// service name -> owning module
    services: BTreeMap<String, String>,
    /// task name -> owning module
    tasks: BTreeMap<String, String>,
    /// (module, test name) pairs
    tests: BTreeSet<(String, String)>,
    edges: BTreeMap<EntityRef, Vec<Edge>>,
}

impl ConfigGraph {
    /// Build and validate the graph from resolved modules
    pub fn build(modules: Vec<Module>) -> GardenResult<Self> {
        let mut graph = Self {
            modules: BTreeMap::new(),
            services: BTreeMap::new(),
            tasks: BTreeMap::new(),
            tests: BTreeSet::new(),
            edges: BTreeMap::new(),
        };

        for module in modules {
            let module_name = module.name().to_string();
            for service in &module.config.service_configs {
                if let Some(other) = graph.services.get(&service.name) {
                    return Err(GardenError::config(format!(
                        "service name '{}' is used by both module '{}' and module '{}'",
                        service.name, other, module_name
                    )));
                }
                graph.services.insert(service.name.clone(), module_name.clone());
            }
            for task in &module.config.task_configs {
                if let Some(other) = graph.tasks.get(&task.name) {
                    return Err(GardenError::config(format!(
                        "task name '{}' is used by both module '{}' and module '{}'",
                        task.name, other, module_name
                    )));
                }
                graph.tasks.insert(task.name.clone(), module_name.clone());
            }
            for test in &module.config.test_configs {
                graph.tests.insert((module_name.clone(), test.name.clone()));
            }
            graph.modules.insert(module_name, Arc::new(module));
        }

        graph.add_edges()?;
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn add_edges(&mut self) -> GardenResult<()> {
        let mut edges: BTreeMap<EntityRef, Vec<Edge>> = BTreeMap::new();

        for (module_name, module) in &self.modules {
            let module_ref = EntityRef::Module(module_name.clone());

            for dep in &module.config.build.dependencies {
                if !self.modules.contains_key(&dep.name) {
                    return Err(GardenError::dependency(format!(
                        "module '{}' declares a build dependency on unknown module '{}'",
                        module_name, dep.name
                    ))
                    .with_hint("check the module name in build.dependencies"));
                }
                edges.entry(module_ref.clone()).or_default().push(Edge {
                    kind: DependencyKind::Build,
                    to: EntityRef::Module(dep.name.clone()),
                });
            }

            for service in &module.config.service_configs {
                let from = EntityRef::Service(service.name.clone());
                for dep in &service.dependencies {
                    let to = self.runtime_ref(dep).ok_or_else(|| {
                        unknown_runtime_dep("service", &service.name, dep)
                    })?;
                    edges.entry(from.clone()).or_default().push(Edge {
                        kind: DependencyKind::Service,
                        to,
                    });
                }
            }

            for task in &module.config.task_configs {
                let from = EntityRef::Task(task.name.clone());
                for dep in &task.dependencies {
                    let to = self
                        .runtime_ref(dep)
                        .ok_or_else(|| unknown_runtime_dep("task", &task.name, dep))?;
                    edges.entry(from.clone()).or_default().push(Edge {
                        kind: DependencyKind::Task,
                        to,
                    });
                }
            }

            for test in &module.config.test_configs {
                let from = EntityRef::test(module_name.clone(), test.name.clone());
                for dep in &test.dependencies {
                    let to = self
                        .runtime_ref(dep)
                        .ok_or_else(|| unknown_runtime_dep("test", &test.name, dep))?;
                    edges.entry(from.clone()).or_default().push(Edge {
                        kind: DependencyKind::Test,
                        to,
                    });
                }
            }
        }

        self.edges = edges;
        Ok(())
    }

    /// Resolve a runtime dependency name to a service or task node
    fn runtime_ref(&self, name: &str) -> Option<EntityRef> {
        if self.services.contains_key(name) {
            Some(EntityRef::Service(name.to_string()))
        } else if self.tasks.contains_key(name) {
            Some(EntityRef::Task(name.to_string()))
        } else {
            None
        }
    }

    /// DFS over the union graph; reports the full cycle path on a back edge
    fn check_acyclic(&self) -> GardenResult<()> {
        #[derive(PartialEq, Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<EntityRef, Mark> = BTreeMap::new();

        // Iterative DFS, one frame per (node, next-edge-index)
        for start in self.edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut stack: Vec<(EntityRef, usize)> = vec![(start.clone(), 0)];
            marks.insert(start.clone(), Mark::Visiting);

            while let Some((node, index)) = stack.last().cloned() {
                let next = self
                    .edges
                    .get(&node)
                    .and_then(|edges| edges.get(index))
                    .map(|e| e.to.clone());
                match next {
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                    Some(to) => {
                        stack.last_mut().unwrap().1 += 1;
                        match marks.get(&to) {
                            Some(Mark::Visiting) => {
                                let mut chain: Vec<String> = Vec::new();
                                let from = stack
                                    .iter()
                                    .position(|(n, _)| *n == to)
                                    .unwrap_or(0);
                                chain.push(to.display_name());
                                for (n, _) in stack[from + 1..].iter() {
                                    chain.push(n.display_name());
                                }
                                chain.push(to.display_name());
                                chain.reverse();
                                return Err(GardenError::cycle(
                                    "dependency cycle detected in the project",
                                    &chain,
                                ));
                            }
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(to.clone(), Mark::Visiting);
                                stack.push((to, 0));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> GardenResult<Arc<Module>> {
        self.modules.get(name).cloned().ok_or_else(|| {
            GardenError::dependency(format!("module '{}' is not defined in the project", name))
                .with_hint("run `garden get modules` to list what is configured")
        })
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.values()
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Owning module of a service
    pub fn service_owner(&self, name: &str) -> GardenResult<Arc<Module>> {
        let module = self.services.get(name).ok_or_else(|| {
            GardenError::dependency(format!("service '{}' is not defined in the project", name))
        })?;
        self.module(module)
    }

    pub fn task_owner(&self, name: &str) -> GardenResult<Arc<Module>> {
        let module = self.tasks.get(name).ok_or_else(|| {
            GardenError::dependency(format!("task '{}' is not defined in the project", name))
        })?;
        self.module(module)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// All (module, test) pairs
    pub fn test_refs(&self) -> Vec<EntityRef> {
        self.tests
            .iter()
            .map(|(module, name)| EntityRef::test(module.clone(), name.clone()))
            .collect()
    }

    /// Owning module of any entity
    pub fn owner(&self, entity: &EntityRef) -> GardenResult<Arc<Module>> {
        match entity {
            EntityRef::Module(n) => self.module(n),
            EntityRef::Service(n) => self.service_owner(n),
            EntityRef::Task(n) => self.task_owner(n),
            EntityRef::Test { module, .. } => self.module(module),
        }
    }

    /// Direct dependencies, optionally restricted to one edge label
    pub fn dependencies_of(
        &self,
        entity: &EntityRef,
        kind: Option<DependencyKind>,
    ) -> Vec<EntityRef> {
        self.edges
            .get(entity)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| kind.map(|k| e.kind == k).unwrap_or(true))
                    .map(|e| e.to.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive dependencies in depth-first order, optionally filtered by
    /// edge label. The starting entity is not included.
    pub fn transitive_dependencies(
        &self,
        entity: &EntityRef,
        kind: Option<DependencyKind>,
    ) -> Vec<EntityRef> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut stack = self.dependencies_of(entity, kind);
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            stack.extend(self.dependencies_of(&next, kind));
            out.push(next);
        }
        out
    }
}

fn unknown_runtime_dep(kind: &str, owner: &str, dep: &str) -> GardenError {
    GardenError::dependency(format!(
        "{} '{}' depends on '{}', which is neither a service nor a task",
        kind, owner, dep
    ))
    .with_hint("dependencies of services, tasks and tests must name a service or a task")
}
