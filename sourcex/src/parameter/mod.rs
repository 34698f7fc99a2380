//! Model-fitting parameters with declared dependencies.
//!
//! A [`ParameterGraph`] describes free, constant and dependent parameters.
//! Dependent parameters are computed from their dependees, which must be
//! declared first, so the graph is acyclic by construction.
//! [`ParameterManager`] binds graph nodes to per-entity values and tracks
//! which of them a fit actually read.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entity::EntityId;
use crate::error::{Error, Result};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(u32);

impl ParameterId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

type Combine = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

#[derive(Clone)]
pub enum ParameterKind {
    Free { initial: f64 },
    Constant(f64),
    Dependent {
        dependees: Vec<ParameterId>,
        combine: Combine,
    },
}

impl fmt::Debug for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Free { initial } => f.debug_struct("Free").field("initial", initial).finish(),
            ParameterKind::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            ParameterKind::Dependent { dependees, .. } => f
                .debug_struct("Dependent")
                .field("dependees", dependees)
                .finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParameterNode {
    pub name: String,
    pub kind: ParameterKind,
}

#[derive(Clone, Debug, Default)]
pub struct ParameterGraph {
    nodes: Vec<ParameterNode>,
}

impl ParameterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: impl Into<String>, kind: ParameterKind) -> ParameterId {
        let id = ParameterId(self.nodes.len() as u32);
        self.nodes.push(ParameterNode {
            name: name.into(),
            kind,
        });
        id
    }

    pub fn add_free(&mut self, name: impl Into<String>, initial: f64) -> ParameterId {
        self.push(name, ParameterKind::Free { initial })
    }

    pub fn add_constant(&mut self, name: impl Into<String>, value: f64) -> ParameterId {
        self.push(name, ParameterKind::Constant(value))
    }

    /// Adds a parameter computed by `combine` from the values of
    /// `dependees`, given in the same order.
    pub fn add_dependent<F>(
        &mut self,
        name: impl Into<String>,
        dependees: &[ParameterId],
        combine: F,
    ) -> Result<ParameterId>
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        let next = ParameterId(self.nodes.len() as u32);
        if let Some(&missing) = dependees.iter().find(|id| id.index() >= self.nodes.len()) {
            return Err(Error::UndeclaredDependee {
                parameter: next,
                dependee: missing,
            });
        }
        Ok(self.push(
            name,
            ParameterKind::Dependent {
                dependees: dependees.to_vec(),
                combine: Arc::new(combine),
            },
        ))
    }

    pub fn node(&self, id: ParameterId) -> Option<&ParameterNode> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependees(&self, id: ParameterId) -> &[ParameterId] {
        match self.nodes.get(id.index()).map(|node| &node.kind) {
            Some(ParameterKind::Dependent { dependees, .. }) => dependees,
            _ => &[],
        }
    }

    /// `id` and every parameter it transitively depends on.
    pub fn closure(&self, id: ParameterId) -> BTreeSet<ParameterId> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if seen.insert(next) {
                pending.extend_from_slice(self.dependees(next));
            }
        }
        seen
    }
}

/// A value handed to a fitting engine.
#[derive(Debug)]
pub struct FitParameter {
    id: ParameterId,
    value: RwLock<f64>,
}

impl FitParameter {
    pub fn new(id: ParameterId, value: f64) -> Arc<Self> {
        Arc::new(Self {
            id,
            value: RwLock::new(value),
        })
    }

    pub fn id(&self) -> ParameterId {
        self.id
    }

    pub fn value(&self) -> f64 {
        *self.value.read()
    }

    pub fn set_value(&self, value: f64) {
        *self.value.write() = value;
    }
}

/// Per-entity parameter bindings with access tracking.
///
/// Reading a dependent parameter marks every parameter it is computed
/// from as accessed too, so a fit knows which free values it must solve
/// for.
#[derive(Debug)]
pub struct ParameterManager {
    graph: Arc<ParameterGraph>,
    params: HashMap<(EntityId, ParameterId), Arc<FitParameter>>,
    accessed: BTreeSet<(EntityId, ParameterId)>,
    // parameters owned on behalf of the fitting engine
    stored: Vec<Arc<FitParameter>>,
}

impl ParameterManager {
    pub fn new(graph: Arc<ParameterGraph>) -> Self {
        Self {
            graph,
            params: HashMap::new(),
            accessed: BTreeSet::new(),
            stored: Vec::new(),
        }
    }

    pub fn graph(&self) -> &ParameterGraph {
        &self.graph
    }

    pub fn add_parameter(&mut self, entity: EntityId, parameter: Arc<FitParameter>) -> Result<()> {
        let id = parameter.id();
        if self.graph.node(id).is_none() {
            return Err(Error::UnknownParameter {
                entity,
                parameter: id,
            });
        }
        self.params.insert((entity, id), parameter);
        Ok(())
    }

    /// Binds every graph node for `entity`, free parameters at their
    /// initial value, dependent ones at their computed value.
    pub fn add_all(&mut self, entity: EntityId) -> Result<()> {
        for index in 0..self.graph.len() {
            let id = ParameterId(index as u32);
            let value = self.initial_value(entity, id)?;
            self.add_parameter(entity, FitParameter::new(id, value))?;
        }
        Ok(())
    }

    fn initial_value(&self, entity: EntityId, id: ParameterId) -> Result<f64> {
        match self.graph.node(id).map(|node| &node.kind) {
            Some(ParameterKind::Free { initial }) => Ok(*initial),
            Some(ParameterKind::Constant(value)) => Ok(*value),
            Some(ParameterKind::Dependent { .. }) => self.evaluate(entity, id),
            None => Err(Error::UnknownParameter {
                entity,
                parameter: id,
            }),
        }
    }

    pub fn store_parameter(&mut self, parameter: Arc<FitParameter>) {
        self.stored.push(parameter);
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }

    /// Returns the parameter and marks it and everything it depends on as
    /// accessed.
    pub fn get_parameter(&mut self, entity: EntityId, id: ParameterId) -> Result<Arc<FitParameter>> {
        let parameter = self
            .params
            .get(&(entity, id))
            .cloned()
            .ok_or(Error::UnknownParameter {
                entity,
                parameter: id,
            })?;
        for dependee in self.graph.closure(id) {
            self.accessed.insert((entity, dependee));
        }
        Ok(parameter)
    }

    /// Current value of `id`; dependent parameters are recomputed from
    /// their dependees.
    pub fn evaluate(&self, entity: EntityId, id: ParameterId) -> Result<f64> {
        match self.graph.node(id).map(|node| &node.kind) {
            None => Err(Error::UnknownParameter {
                entity,
                parameter: id,
            }),
            Some(ParameterKind::Constant(value)) => Ok(*value),
            Some(ParameterKind::Free { .. }) => self
                .params
                .get(&(entity, id))
                .map(|parameter| parameter.value())
                .ok_or(Error::UnknownParameter {
                    entity,
                    parameter: id,
                }),
            Some(ParameterKind::Dependent { dependees, combine }) => {
                let values = dependees
                    .iter()
                    .map(|&dependee| self.evaluate(entity, dependee))
                    .collect::<Result<Vec<_>>>()?;
                Ok(combine(&values))
            }
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn is_param_accessed(&self, entity: EntityId, id: ParameterId) -> bool {
        self.accessed.contains(&(entity, id))
    }

    pub fn clear_access_check(&mut self) {
        self.accessed.clear();
    }

    /// Drops every binding nobody read since the last access reset and
    /// returns how many were dropped.
    pub fn prune_unaccessed(&mut self) -> usize {
        let before = self.params.len();
        let accessed = &self.accessed;
        self.params.retain(|key, _| accessed.contains(key));
        before - self.params.len()
    }
}
