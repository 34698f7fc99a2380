//! Sources and source groups: the entities properties are computed for.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::property::{Property, PropertyId, PropertyStore};
use crate::task::{Task, TaskResolver};


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A recoverable failure recorded while measuring an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub property: &'static str,
    pub message: String,
}

/// State shared by every entity kind.
#[derive(Debug)]
pub struct EntityCore {
    id: EntityId,
    store: PropertyStore,
    // ids currently being computed, innermost last
    resolving: Vec<PropertyId>,
    failures: Vec<Failure>,
    // properties whose task failed recoverably, replayed instead of rerun
    failed: HashMap<PropertyId, Error>,
}

impl EntityCore {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            store: PropertyStore::new(id),
            resolving: Vec::new(),
            failures: Vec::new(),
            failed: HashMap::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PropertyStore {
        &mut self.store
    }

    fn cycle_chain(&self, id: PropertyId) -> String {
        let start = self
            .resolving
            .iter()
            .position(|&pending| pending == id)
            .unwrap_or(0);
        self.resolving[start..]
            .iter()
            .chain(std::iter::once(&id))
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Lazily computed, memoized properties.
///
/// `get_property` returns the stored value if present; otherwise it asks
/// the [`TaskResolver`] for the task producing the property and runs it on
/// `self`. Tasks may request further properties recursively. A request for
/// a property that is already being computed up the call chain is a
/// dependency cycle.
pub trait Entity: Send + Sized + 'static {
    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    fn resolver(&self) -> &Arc<TaskResolver>;

    fn create_task(resolver: &TaskResolver, id: PropertyId) -> Option<Arc<dyn Task<Self>>>;

    fn id(&self) -> EntityId {
        self.core().id
    }

    fn get_property<P: Property>(&mut self) -> Result<Arc<P>> {
        self.get_indexed_property::<P>(0)
    }

    fn get_indexed_property<P: Property>(&mut self, instance: u32) -> Result<Arc<P>> {
        let id = PropertyId::indexed::<P>(instance);
        if let Some(value) = self.core().store.get::<P>(id) {
            self.core_mut().store.mark_accessed(id);
            return Ok(value);
        }

        if let Some(err) = self.core().failed.get(&id) {
            return Err(err.replay());
        }

        if self.core().resolving.contains(&id) {
            return Err(Error::DependencyCycle {
                entity: self.id(),
                chain: self.core().cycle_chain(id),
            });
        }

        let task = Self::create_task(self.resolver(), id).ok_or(Error::UnknownProperty {
            name: P::NAME,
            instance,
        })?;

        self.core_mut().resolving.push(id);
        let result = task.compute_properties(self);
        self.core_mut().resolving.pop();
        if let Err(err) = result {
            if err.is_recoverable() {
                self.core_mut().failed.insert(id, err.replay());
            }
            return Err(err);
        }

        let value = self
            .core()
            .store
            .get::<P>(id)
            .ok_or(Error::PropertyNotProduced {
                name: P::NAME,
                instance,
            })?;
        self.core_mut().store.mark_accessed(id);
        Ok(value)
    }

    fn set_property<P: Property>(&mut self, value: P) {
        self.set_indexed_property(0, value);
    }

    fn set_indexed_property<P: Property>(&mut self, instance: u32, value: P) {
        self.core_mut()
            .store
            .set(PropertyId::indexed::<P>(instance), value);
    }

    /// Stored value, if any; never computes and never counts as an access.
    fn peek_property<P: Property>(&self) -> Option<Arc<P>> {
        self.peek_indexed_property(0)
    }

    fn peek_indexed_property<P: Property>(&self, instance: u32) -> Option<Arc<P>> {
        self.core().store.get::<P>(PropertyId::indexed::<P>(instance))
    }

    fn has_property<P: Property>(&self) -> bool {
        self.core().store.contains(PropertyId::of::<P>())
    }

    /// True when the property's task already failed recoverably on this
    /// entity.
    fn has_failed(&self, id: PropertyId) -> bool {
        self.core().failed.contains_key(&id)
    }

    fn clear_access_check(&mut self) {
        self.core_mut().store.clear_access_check();
    }

    fn is_accessed(&self, id: PropertyId) -> bool {
        self.core().store.is_accessed(id)
    }

    fn record_failure(&mut self, property: &'static str, message: impl Into<String>) {
        self.core_mut().failures.push(Failure {
            property,
            message: message.into(),
        });
    }

    fn failures(&self) -> &[Failure] {
        &self.core().failures
    }
}

/// One detected source.
pub struct Source {
    core: EntityCore,
    resolver: Arc<TaskResolver>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("core", &self.core).finish()
    }
}

impl Entity for Source {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn resolver(&self) -> &Arc<TaskResolver> {
        &self.resolver
    }

    fn create_task(resolver: &TaskResolver, id: PropertyId) -> Option<Arc<dyn Task<Self>>> {
        resolver.create_source_task(id)
    }
}

/// Sources that must be measured together.
pub struct SourceGroup {
    core: EntityCore,
    resolver: Arc<TaskResolver>,
    sources: Vec<Source>,
}

impl fmt::Debug for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceGroup")
            .field("core", &self.core)
            .field("sources", &self.sources)
            .finish()
    }
}

impl SourceGroup {
    pub fn add_source(&mut self, source: Source) {
        self.sources.push(source);
    }

    /// Moves every source of `other` into this group.
    pub fn merge(&mut self, other: SourceGroup) {
        self.sources.extend(other.sources);
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [Source] {
        &mut self.sources
    }

    pub fn retain_sources(&mut self, keep: impl FnMut(&Source) -> bool) {
        self.sources.retain(keep);
    }

    pub fn take_sources(&mut self) -> Vec<Source> {
        std::mem::take(&mut self.sources)
    }

    pub fn into_sources(self) -> Vec<Source> {
        self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Entity for SourceGroup {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn resolver(&self) -> &Arc<TaskResolver> {
        &self.resolver
    }

    fn create_task(resolver: &TaskResolver, id: PropertyId) -> Option<Arc<dyn Task<Self>>> {
        resolver.create_group_task(id)
    }
}

/// Allocates entity ids and builds entities bound to one resolver.
#[derive(Debug)]
pub struct EntityFactory {
    resolver: Arc<TaskResolver>,
    next_id: AtomicU64,
}

impl EntityFactory {
    pub fn new(resolver: Arc<TaskResolver>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn resolver(&self) -> &Arc<TaskResolver> {
        &self.resolver
    }

    fn next_id(&self) -> EntityId {
        EntityId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn create_source(&self) -> Source {
        Source {
            core: EntityCore::new(self.next_id()),
            resolver: self.resolver.clone(),
        }
    }

    pub fn create_group(&self) -> SourceGroup {
        SourceGroup {
            core: EntityCore::new(self.next_id()),
            resolver: self.resolver.clone(),
            sources: Vec::new(),
        }
    }
}
