//! Kernel construction and configuration validation.
//!
//! [`KernelBuilder`] holds the pluggable implementations registered under
//! identifiers and resolves a [`KernelConfig`] against them. Every
//! configuration fault is reported here; nothing is checked lazily at run
//! time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::administration::Administration;
use super::asset::AssetManager;
use super::escalation::{EscalationHandler, EscalationProcedure, LoggingEscalationHandler};
use super::fault::{Fault, FaultType, FaultTypeRegistry};
use super::function::{FunctionContext, ManagedFunction};
use super::governance::GovernanceFactory;
use super::managed_object::{
    FreeListPoolFactory, ManagedObjectPoolFactory, ManagedObjectSource, ManagedObjectSourceBinding,
};
use super::office::{
    DutyMetaData, FlowMetaData, FunctionIndex, FunctionMetaData, GovernanceMetaData,
    ManagedObjectMetaData, ObjectBinding, Office, OfficeMetaData,
};
use super::team::{builtin_team_sources, PassiveTeam, Team, TeamSource};
use super::{Kernel, KernelContext};
use crate::types::{
    AdministrationConfig, DependencyConfig, Error, FlowConfig, KernelConfig, OfficeConfig, Result,
};

/// Registers implementations and builds a [`Kernel`] from configuration.
pub struct KernelBuilder {
    config: KernelConfig,
    team_sources: HashMap<String, Arc<dyn TeamSource>>,
    object_sources: HashMap<String, Arc<dyn ManagedObjectSource>>,
    pool_factories: HashMap<String, Arc<dyn ManagedObjectPoolFactory>>,
    functions: HashMap<String, Arc<dyn ManagedFunction>>,
    governance: HashMap<String, Arc<dyn GovernanceFactory>>,
    administration: HashMap<String, Arc<dyn Administration>>,
    fault_types: FaultTypeRegistry,
    escalation_handler: Arc<dyn EscalationHandler>,
}

impl fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("offices", &self.config.offices.len())
            .field("functions", &self.functions.len())
            .field("fault_types", &self.fault_types.len())
            .finish()
    }
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        let mut pool_factories: HashMap<String, Arc<dyn ManagedObjectPoolFactory>> = HashMap::new();
        pool_factories.insert("free_list".to_string(), Arc::new(FreeListPoolFactory));
        Self {
            config,
            team_sources: builtin_team_sources()
                .into_iter()
                .map(|(id, source)| (id.to_string(), source))
                .collect(),
            object_sources: HashMap::new(),
            pool_factories,
            functions: HashMap::new(),
            governance: HashMap::new(),
            administration: HashMap::new(),
            fault_types: FaultTypeRegistry::new(),
            escalation_handler: Arc::new(LoggingEscalationHandler),
        }
    }

    pub fn team_source(mut self, id: impl Into<String>, source: Arc<dyn TeamSource>) -> Self {
        self.team_sources.insert(id.into(), source);
        self
    }

    pub fn managed_object_source(mut self, id: impl Into<String>, source: Arc<dyn ManagedObjectSource>) -> Self {
        self.object_sources.insert(id.into(), source);
        self
    }

    pub fn pool_factory(mut self, id: impl Into<String>, factory: Arc<dyn ManagedObjectPoolFactory>) -> Self {
        self.pool_factories.insert(id.into(), factory);
        self
    }

    /// Register function logic written as a closure.
    pub fn function<F>(self, id: impl Into<String>, logic: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> std::result::Result<(), Fault> + Send + Sync + 'static,
    {
        self.function_logic(id, Arc::new(logic))
    }

    pub fn function_logic(mut self, id: impl Into<String>, logic: Arc<dyn ManagedFunction>) -> Self {
        self.functions.insert(id.into(), logic);
        self
    }

    pub fn governance(mut self, id: impl Into<String>, factory: Arc<dyn GovernanceFactory>) -> Self {
        self.governance.insert(id.into(), factory);
        self
    }

    pub fn administration(mut self, id: impl Into<String>, administration: Arc<dyn Administration>) -> Self {
        self.administration.insert(id.into(), administration);
        self
    }

    /// Make an application fault type nameable in escalation configuration.
    pub fn fault_type(mut self, kind: &'static FaultType) -> Self {
        self.fault_types.register(kind);
        self
    }

    /// Handler for faults no escalation procedure handles.
    pub fn escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation_handler = handler;
        self
    }

    /// Resolve and validate the configuration.
    pub fn build(self) -> Result<Kernel> {
        let mut teams: HashMap<String, Arc<dyn Team>> = HashMap::new();
        let mut team_order = Vec::new();
        for config in &self.config.teams {
            if teams.contains_key(&config.name) {
                return Err(Error::configuration(format!("duplicate team {}", config.name)));
            }
            let source = self.team_sources.get(&config.source).ok_or_else(|| {
                Error::configuration(format!(
                    "team {} uses unknown team source {}",
                    config.name, config.source
                ))
            })?;
            let team = source.create_team(&config.name, &config.properties)?;
            team_order.push(team.clone());
            teams.insert(config.name.clone(), team);
        }

        let mut bindings: HashMap<String, Arc<ManagedObjectSourceBinding>> = HashMap::new();
        let mut binding_order = Vec::new();
        for config in &self.config.managed_object_sources {
            if bindings.contains_key(&config.name) {
                return Err(Error::configuration(format!(
                    "duplicate managed object source {}",
                    config.name
                )));
            }
            let source = self.object_sources.get(&config.source).cloned().ok_or_else(|| {
                Error::configuration(format!(
                    "managed object source {} uses unregistered source {}",
                    config.name, config.source
                ))
            })?;
            let pool = match &config.pool {
                None => None,
                Some(id) => {
                    let factory = self.pool_factories.get(id).ok_or_else(|| {
                        Error::configuration(format!(
                            "managed object source {} uses unknown pool {}",
                            config.name, id
                        ))
                    })?;
                    Some(factory.create_pool(&config.name, source.clone(), &config.properties)?)
                }
            };
            let binding = Arc::new(ManagedObjectSourceBinding {
                name: config.name.clone(),
                source,
                pool,
                timeout: config.timeout,
                async_timeout: config.async_timeout,
                properties: config.properties.clone(),
            });
            binding_order.push(binding.clone());
            bindings.insert(config.name.clone(), binding);
        }

        let context = Arc::new(KernelContext::new(
            Arc::new(AssetManager::new()),
            self.escalation_handler.clone(),
            self.config.assets.max_nodes_per_run,
            binding_order
                .iter()
                .filter_map(|binding| binding.pool.as_ref())
                .filter_map(|pool| pool.thread_completion_listener())
                .collect(),
        ));

        let mut offices: Vec<Office> = Vec::new();
        for config in &self.config.offices {
            if offices.iter().any(|office| office.name() == config.name) {
                return Err(Error::configuration(format!("duplicate office {}", config.name)));
            }
            let resolver = OfficeResolver {
                builder: &self,
                config,
                teams: &teams,
                bindings: &bindings,
            };
            let meta = resolver.resolve()?;
            for function in &meta.functions {
                if !team_order.iter().any(|t| t.name() == function.team.name()) {
                    team_order.push(function.team.clone());
                }
            }
            offices.push(Office::new(meta, context.clone()));
        }

        tracing::info!(
            "kernel_built: teams={}, sources={}, offices={}",
            team_order.len(),
            binding_order.len(),
            offices.len()
        );
        Ok(Kernel::new(
            context,
            team_order,
            binding_order,
            offices,
            self.config.assets.clone(),
        ))
    }
}

// =============================================================================
// Office resolution
// =============================================================================

struct OfficeResolver<'a> {
    builder: &'a KernelBuilder,
    config: &'a OfficeConfig,
    teams: &'a HashMap<String, Arc<dyn Team>>,
    bindings: &'a HashMap<String, Arc<ManagedObjectSourceBinding>>,
}

impl OfficeResolver<'_> {
    fn error(&self, message: impl fmt::Display) -> Error {
        Error::configuration(format!("office {}: {}", self.config.name, message))
    }

    fn resolve(&self) -> Result<OfficeMetaData> {
        let default_team: Arc<dyn Team> = match &self.config.default_team {
            Some(name) => self.team(name)?,
            None => Arc::new(PassiveTeam::new(format!("{}:passive", self.config.name))),
        };

        let object_index = index_names(self.config.managed_objects.iter().map(|o| &o.name))
            .map_err(|name| self.error(format_args!("duplicate managed object {}", name)))?;
        let function_index = index_names(self.config.functions.iter().map(|f| &f.name))
            .map_err(|name| self.error(format_args!("duplicate function {}", name)))?;
        let governance_index = index_names(self.config.governance.iter().map(|g| &g.name))
            .map_err(|name| self.error(format_args!("duplicate governance {}", name)))?;

        let objects = self.resolve_objects(&object_index)?;
        check_acyclic(&objects).map_err(|name| self.error(format_args!("dependency cycle through {}", name)))?;

        let resolve_handler = |name: &str| function_index.get(name).copied();
        let escalation =
            EscalationProcedure::resolve(&self.config.escalations, &self.builder.fault_types, resolve_handler)
                .map_err(|e| self.error(e))?;

        let mut governance = Vec::with_capacity(self.config.governance.len());
        for config in &self.config.governance {
            let factory = self.builder.governance.get(&config.governance).cloned().ok_or_else(|| {
                self.error(format_args!(
                    "governance {} uses unregistered governance {}",
                    config.name, config.governance
                ))
            })?;
            governance.push(GovernanceMetaData {
                name: config.name.clone(),
                factory,
                extension: config.extension.clone(),
                team: config.team.as_ref().map(|name| self.team(name)).transpose()?,
                flows: self.flows(&config.flows, &function_index)?,
                escalation: EscalationProcedure::resolve(
                    &config.escalations,
                    &self.builder.fault_types,
                    resolve_handler,
                )
                .map_err(|e| self.error(format_args!("governance {}: {}", config.name, e)))?,
            });
        }

        let mut functions = Vec::with_capacity(self.config.functions.len());
        for config in &self.config.functions {
            let scoped = |e: Error| self.error(format_args!("function {}: {}", config.name, e));
            let logic = self.builder.functions.get(&config.function).cloned().ok_or_else(|| {
                self.error(format_args!(
                    "function {} uses unregistered logic {}",
                    config.name, config.function
                ))
            })?;
            let team = match &config.team {
                Some(name) => self.team(name)?,
                None => default_team.clone(),
            };
            let bindings = self
                .object_bindings(&config.objects, &object_index)
                .map_err(scoped)?;
            let load_order = load_order(&objects, bindings.iter().map(|b| b.object));
            let next = config
                .next
                .as_ref()
                .map(|name| {
                    function_index
                        .get(name)
                        .copied()
                        .ok_or_else(|| self.error(format_args!("function {} has unknown next {}", config.name, name)))
                })
                .transpose()?;
            let required_governance = config
                .governance
                .iter()
                .map(|name| {
                    governance_index.get(name).copied().ok_or_else(|| {
                        self.error(format_args!("function {} requires unknown governance {}", config.name, name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let resolve_duty = |duty: &AdministrationConfig| -> Result<DutyMetaData> {
                let administration = self.builder.administration.get(&duty.administration).cloned().ok_or_else(|| {
                    self.error(format_args!(
                        "duty {} of function {} uses unregistered administration {}",
                        duty.name, config.name, duty.administration
                    ))
                })?;
                let objects = duty
                    .objects
                    .iter()
                    .map(|name| {
                        bindings
                            .iter()
                            .find(|b| &b.name == name)
                            .map(|b| b.object)
                            .ok_or_else(|| {
                                self.error(format_args!(
                                    "duty {} administers {} which function {} does not use",
                                    duty.name, name, config.name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(DutyMetaData {
                    name: duty.name.clone(),
                    administration,
                    extension: duty.extension.clone(),
                    objects,
                    team: match &duty.team {
                        Some(name) => self.team(name)?,
                        None => team.clone(),
                    },
                    flows: self.flows(&duty.flows, &function_index)?,
                    escalation: EscalationProcedure::resolve(
                        &duty.escalations,
                        &self.builder.fault_types,
                        resolve_handler,
                    )
                    .map_err(|e| self.error(format_args!("duty {}: {}", duty.name, e)))?,
                })
            };
            let pre_duties = config
                .pre_administration
                .iter()
                .map(&resolve_duty)
                .collect::<Result<Vec<_>>>()?;
            let post_duties = config
                .post_administration
                .iter()
                .map(&resolve_duty)
                .collect::<Result<Vec<_>>>()?;

            functions.push(FunctionMetaData {
                name: config.name.clone(),
                logic,
                team: team.clone(),
                objects: bindings,
                load_order,
                flows: self.flows(&config.flows, &function_index)?,
                next,
                escalation: EscalationProcedure::resolve(
                    &config.escalations,
                    &self.builder.fault_types,
                    resolve_handler,
                )
                .map_err(scoped)?,
                governance: required_governance,
                pre_duties,
                post_duties,
            });
        }

        Ok(OfficeMetaData {
            name: self.config.name.clone(),
            functions,
            function_index,
            objects,
            governance,
            escalation,
        })
    }

    fn team(&self, name: &str) -> Result<Arc<dyn Team>> {
        self.teams
            .get(name)
            .cloned()
            .ok_or_else(|| self.error(format_args!("unknown team {}", name)))
    }

    fn resolve_objects(&self, object_index: &HashMap<String, usize>) -> Result<Vec<ManagedObjectMetaData>> {
        let mut objects = Vec::with_capacity(self.config.managed_objects.len());
        for config in &self.config.managed_objects {
            let binding = self.bindings.get(&config.source).cloned().ok_or_else(|| {
                self.error(format_args!(
                    "managed object {} uses unknown source {}",
                    config.name, config.source
                ))
            })?;
            let dependencies = self
                .object_bindings(&config.dependencies, object_index)
                .map_err(|e| self.error(format_args!("managed object {}: {}", config.name, e)))?;
            for dependency in &dependencies {
                let scope = self.config.managed_objects[dependency.object].scope;
                if !config.scope.may_depend_on(scope) {
                    return Err(self.error(format_args!(
                        "{:?}-scoped managed object {} cannot depend on {:?}-scoped {}",
                        config.scope, config.name, scope, dependency.name
                    )));
                }
            }
            objects.push(ManagedObjectMetaData {
                name: config.name.clone(),
                binding,
                scope: config.scope,
                dependencies,
            });
        }
        Ok(objects)
    }

    fn object_bindings(
        &self,
        configs: &[DependencyConfig],
        object_index: &HashMap<String, usize>,
    ) -> Result<Vec<ObjectBinding>> {
        configs
            .iter()
            .map(|config| {
                let object = object_index
                    .get(&config.object)
                    .copied()
                    .ok_or_else(|| Error::configuration(format!("unknown managed object {}", config.object)))?;
                Ok(ObjectBinding {
                    key: config.key.clone(),
                    object,
                    name: config.object.clone(),
                })
            })
            .collect()
    }

    fn flows(&self, configs: &[FlowConfig], function_index: &HashMap<String, FunctionIndex>) -> Result<Vec<FlowMetaData>> {
        configs
            .iter()
            .map(|config| {
                let function = function_index
                    .get(&config.function)
                    .copied()
                    .ok_or_else(|| self.error(format_args!("flow to unknown function {}", config.function)))?;
                Ok(FlowMetaData {
                    key: config.key.clone(),
                    function,
                    function_name: config.function.clone(),
                    spawn_thread: config.spawn_thread,
                })
            })
            .collect()
    }
}

/// Index names by position, failing on the first duplicate.
fn index_names<'a>(names: impl Iterator<Item = &'a String>) -> std::result::Result<HashMap<String, usize>, String> {
    let mut index = HashMap::new();
    for (position, name) in names.enumerate() {
        if index.insert(name.clone(), position).is_some() {
            return Err(name.clone());
        }
    }
    Ok(index)
}

/// Fail with the name of an object on a dependency cycle.
fn check_acyclic(objects: &[ManagedObjectMetaData]) -> std::result::Result<(), String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(object: usize, objects: &[ManagedObjectMetaData], marks: &mut [Mark]) -> std::result::Result<(), String> {
        match marks[object] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(objects[object].name.clone()),
            Mark::Unvisited => {}
        }
        marks[object] = Mark::InProgress;
        for dependency in &objects[object].dependencies {
            visit(dependency.object, objects, marks)?;
        }
        marks[object] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; objects.len()];
    (0..objects.len()).try_for_each(|object| visit(object, objects, &mut marks))
}

/// Objects reachable from `roots`, dependencies before dependents.
fn load_order(objects: &[ManagedObjectMetaData], roots: impl Iterator<Item = usize>) -> Vec<usize> {
    fn visit(object: usize, objects: &[ManagedObjectMetaData], seen: &mut HashSet<usize>, order: &mut Vec<usize>) {
        if !seen.insert(object) {
            return;
        }
        for dependency in &objects[object].dependencies {
            visit(dependency.object, objects, seen, order);
        }
        order.push(object);
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for root in roots {
        visit(root, objects, &mut seen, &mut order);
    }
    order
}
