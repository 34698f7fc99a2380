//! Tasks compute properties; factories create them; the resolver maps a
//! requested property to the task producing it.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::{Config, ConfigDependencies};
use crate::entity::{Source, SourceGroup};
use crate::error::{Error, Result};
use crate::property::{PropertyId, PropertyKind};

#[cfg(test)]
mod tests;

/// Computes one or more properties of an entity and stores them on it.
pub trait Task<E>: Send + Sync {
    fn compute_properties(&self, entity: &mut E) -> Result<()>;
}

/// A [`Task`] backed by a closure.
pub struct FnTask<F> {
    func: F,
}

impl<F> FnTask<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<E, F> Task<E> for FnTask<F>
where
    F: Fn(&mut E) -> Result<()> + Send + Sync,
{
    fn compute_properties(&self, entity: &mut E) -> Result<()> {
        (self.func)(entity)
    }
}

pub fn source_task<F>(func: F) -> Arc<dyn Task<Source>>
where
    F: Fn(&mut Source) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnTask::new(func))
}

pub fn group_task<F>(func: F) -> Arc<dyn Task<SourceGroup>>
where
    F: Fn(&mut SourceGroup) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnTask::new(func))
}

/// Creates tasks for the property kinds it declares.
pub trait TaskFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn produced_properties(&self) -> Vec<PropertyKind>;

    /// Declares the plugin configuration sections this factory reads.
    fn report_config_dependencies(&self, _deps: &mut ConfigDependencies) {}

    fn configure(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    fn create_source_task(&self, _id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        None
    }

    fn create_group_task(&self, _id: PropertyId) -> Option<Arc<dyn Task<SourceGroup>>> {
        None
    }
}

/// Task factories, at most one per produced property kind.
#[derive(Default)]
pub struct TaskFactoryRegistry {
    factories: Vec<Box<dyn TaskFactory>>,
    by_kind: HashMap<PropertyKind, usize>,
}

impl fmt::Debug for TaskFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.name()))
            .finish()
    }
}

impl TaskFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn TaskFactory>) -> Result<()> {
        let produced = factory.produced_properties();
        for kind in &produced {
            if self.by_kind.contains_key(kind) {
                return Err(Error::DuplicateTaskFactory { name: kind.name() });
            }
        }

        let index = self.factories.len();
        tracing::debug!(
            factory = factory.name(),
            properties = produced.len(),
            "registered task factory"
        );
        for kind in produced {
            self.by_kind.insert(kind, index);
        }
        self.factories.push(factory);
        Ok(())
    }

    pub fn produces(&self, kind: PropertyKind) -> bool {
        self.by_kind.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn config_dependencies(&self) -> ConfigDependencies {
        let mut deps = ConfigDependencies::default();
        for factory in &self.factories {
            factory.report_config_dependencies(&mut deps);
        }
        deps
    }

    /// Checks that every plugin section is claimed, then configures every
    /// factory.
    pub fn configure(&mut self, config: &Config) -> Result<()> {
        config.check_sections(&self.config_dependencies())?;
        for factory in &mut self.factories {
            factory.configure(config)?;
        }
        Ok(())
    }

    fn factory(&self, kind: PropertyKind) -> Option<&dyn TaskFactory> {
        let index = *self.by_kind.get(&kind)?;
        Some(self.factories[index].as_ref())
    }
}

type TaskCache<E> = RwLock<HashMap<PropertyId, Option<Arc<dyn Task<E>>>>>;

/// Maps property ids to tasks, creating each task once.
pub struct TaskResolver {
    registry: TaskFactoryRegistry,
    source_tasks: TaskCache<Source>,
    group_tasks: TaskCache<SourceGroup>,
}

impl fmt::Debug for TaskResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResolver")
            .field("registry", &self.registry)
            .finish()
    }
}

impl TaskResolver {
    pub fn new(registry: TaskFactoryRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            source_tasks: RwLock::new(HashMap::new()),
            group_tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &TaskFactoryRegistry {
        &self.registry
    }

    pub fn create_source_task(&self, id: PropertyId) -> Option<Arc<dyn Task<Source>>> {
        cached_task(&self.source_tasks, id, || {
            self.registry.factory(id.kind)?.create_source_task(id)
        })
    }

    pub fn create_group_task(&self, id: PropertyId) -> Option<Arc<dyn Task<SourceGroup>>> {
        cached_task(&self.group_tasks, id, || {
            self.registry.factory(id.kind)?.create_group_task(id)
        })
    }
}

fn cached_task<E>(
    cache: &TaskCache<E>,
    id: PropertyId,
    create: impl FnOnce() -> Option<Arc<dyn Task<E>>>,
) -> Option<Arc<dyn Task<E>>> {
    if let Some(task) = cache.read().get(&id) {
        return task.clone();
    }
    let mut cache = cache.write();
    cache.entry(id).or_insert_with(create).clone()
}
