//! Type-erased, memoized property values attached to entities.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::entity::EntityId;

/// A value computed for an entity, identified by its Rust type.
pub trait Property: Any + Send + Sync + fmt::Debug {
    const NAME: &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKind {
    name: &'static str,
    type_id: TypeId,
}

impl PropertyKind {
    pub fn of<P: Property>() -> Self {
        Self {
            name: P::NAME,
            type_id: TypeId::of::<P>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A property kind together with the frame instance it was computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId {
    pub kind: PropertyKind,
    pub instance: u32,
}

impl PropertyId {
    pub fn of<P: Property>() -> Self {
        Self::indexed::<P>(0)
    }

    pub fn indexed<P: Property>(instance: u32) -> Self {
        Self {
            kind: PropertyKind::of::<P>(),
            instance,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind.name, self.instance)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey {
    pub entity: EntityId,
    pub id: PropertyId,
}

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Properties of a single entity plus the set of ids read since the last
/// [`PropertyStore::clear_access_check`].
#[derive(Default)]
pub struct PropertyStore {
    owner: EntityId,
    values: BTreeMap<PropertyId, AnyValue>,
    accessed: BTreeSet<PropertyId>,
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("owner", &self.owner)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("accessed", &self.accessed)
            .finish()
    }
}

impl PropertyStore {
    pub fn new(owner: EntityId) -> Self {
        Self {
            owner,
            values: BTreeMap::new(),
            accessed: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> EntityId {
        self.owner
    }

    pub fn key(&self, id: PropertyId) -> PropertyKey {
        PropertyKey {
            entity: self.owner,
            id,
        }
    }

    /// Returns the stored value without touching the access set.
    pub fn get<P: Property>(&self, id: PropertyId) -> Option<Arc<P>> {
        debug_assert_eq!(id.kind, PropertyKind::of::<P>());
        let value = self.values.get(&id)?.clone();
        value.downcast::<P>().ok()
    }

    /// Stores `value`, replacing any previous value under `id`.
    pub fn set<P: Property>(&mut self, id: PropertyId, value: P) {
        debug_assert_eq!(id.kind, PropertyKind::of::<P>());
        self.values.insert(id, Arc::new(value));
    }

    pub(crate) fn set_any(&mut self, id: PropertyId, value: AnyValue) {
        self.values.insert(id, value);
    }

    pub(crate) fn get_any(&self, id: PropertyId) -> Option<&AnyValue> {
        self.values.get(&id)
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn remove(&mut self, id: PropertyId) -> bool {
        self.accessed.remove(&id);
        self.values.remove(&id).is_some()
    }

    pub fn mark_accessed(&mut self, id: PropertyId) {
        self.accessed.insert(id);
    }

    pub fn is_accessed(&self, id: PropertyId) -> bool {
        self.accessed.contains(&id)
    }

    pub fn clear_access_check(&mut self) {
        self.accessed.clear();
    }

    pub fn accessed(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.accessed.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.values.keys().copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = PropertyKey> + '_ {
        let owner = self.owner;
        self.values
            .keys()
            .map(move |&id| PropertyKey { entity: owner, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Flux(f64);

    impl Property for Flux {
        const NAME: &'static str = "Flux";
    }

    #[derive(Debug)]
    struct Area(usize);

    impl Property for Area {
        const NAME: &'static str = "Area";
    }

    #[test]
    fn set_overwrites_and_get_downcasts() {
        let mut store = PropertyStore::new(EntityId::new(7));
        let id = PropertyId::of::<Flux>();
        assert!(store.get::<Flux>(id).is_none());

        store.set(id, Flux(1.0));
        store.set(id, Flux(2.5));
        assert_eq!(store.len(), 1);
        assert_eq!(*store.get::<Flux>(id).unwrap(), Flux(2.5));
    }

    #[test]
    fn instances_are_distinct_keys() {
        let mut store = PropertyStore::new(EntityId::new(1));
        store.set(PropertyId::indexed::<Flux>(0), Flux(1.0));
        store.set(PropertyId::indexed::<Flux>(2), Flux(3.0));
        store.set(PropertyId::of::<Area>(), Area(4));

        assert_eq!(store.len(), 3);
        assert!(!store.contains(PropertyId::indexed::<Flux>(1)));
        assert_eq!(store.get::<Flux>(PropertyId::indexed::<Flux>(2)).unwrap().0, 3.0);

        let keys: Vec<_> = store.keys().collect();
        assert!(keys.iter().all(|key| key.entity == EntityId::new(1)));
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn access_tracking_is_cleared() {
        let mut store = PropertyStore::new(EntityId::new(1));
        let id = PropertyId::of::<Area>();
        store.set(id, Area(9));

        // reading through the store does not count as an access
        store.get::<Area>(id);
        assert!(!store.is_accessed(id));

        store.mark_accessed(id);
        assert!(store.is_accessed(id));
        store.clear_access_check();
        assert!(!store.is_accessed(id));
        assert!(store.contains(id));
    }

    #[test]
    fn property_id_display() {
        assert_eq!(PropertyId::indexed::<Flux>(3).to_string(), "Flux[3]");
        assert_eq!(PropertyKind::of::<Area>().to_string(), "Area");
    }
}
