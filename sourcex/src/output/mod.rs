//! Catalog columns and the sinks that write them.
//!
//! A column is bound to one property. The measurement stage computes it
//! through [`OutputColumn::compute_source`] or
//! [`OutputColumn::compute_group`]; sinks only read stored values with
//! [`OutputColumn::value`] and never trigger computation.

mod ascii;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entity::{Entity, Failure, Source, SourceGroup};
use crate::error::{Error, Result};
use crate::property::{Property, PropertyId};

pub use ascii::AsciiCatalog;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    Float(f64),
    Missing,
}

impl ColumnValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ColumnValue::Int(v) => Some(v as f64),
            ColumnValue::Float(v) => Some(v),
            ColumnValue::Missing => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ColumnValue::Int(v) => Some(v),
            ColumnValue::Float(_) | ColumnValue::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ColumnValue::Missing)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{:.6}", v),
            ColumnValue::Missing => f.write_str("nan"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnScope {
    Source,
    Group,
}

type Compute<E> = Arc<dyn Fn(&mut E) -> Result<()> + Send + Sync>;
type Read<E> = Arc<dyn Fn(&E) -> ColumnValue + Send + Sync>;

#[derive(Clone)]
enum ColumnAccess {
    Source {
        compute: Compute<Source>,
        read: Read<Source>,
    },
    Group {
        compute: Compute<SourceGroup>,
        read: Read<SourceGroup>,
    },
}

/// A named catalog column.
#[derive(Clone)]
pub struct OutputColumn {
    name: String,
    property: PropertyId,
    access: ColumnAccess,
}

impl fmt::Debug for OutputColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputColumn")
            .field("name", &self.name)
            .field("property", &self.property)
            .field("scope", &self.scope())
            .finish()
    }
}

impl OutputColumn {
    /// Column read from instance `instance` of a source property.
    pub fn source<P, F>(name: impl Into<String>, instance: u32, read: F) -> Self
    where
        P: Property,
        F: Fn(&P) -> ColumnValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            property: PropertyId::indexed::<P>(instance),
            access: ColumnAccess::Source {
                compute: Arc::new(move |source: &mut Source| {
                    source.get_indexed_property::<P>(instance).map(|_| ())
                }),
                read: Arc::new(move |source: &Source| {
                    source
                        .peek_indexed_property::<P>(instance)
                        .map_or(ColumnValue::Missing, |value| read(&*value))
                }),
            },
        }
    }

    /// Column read from a group property, repeated on every member row.
    pub fn group<P, F>(name: impl Into<String>, read: F) -> Self
    where
        P: Property,
        F: Fn(&P) -> ColumnValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            property: PropertyId::of::<P>(),
            access: ColumnAccess::Group {
                compute: Arc::new(|group: &mut SourceGroup| {
                    group.get_property::<P>().map(|_| ())
                }),
                read: Arc::new(move |group: &SourceGroup| {
                    group
                        .peek_property::<P>()
                        .map_or(ColumnValue::Missing, |value| read(&*value))
                }),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self) -> PropertyId {
        self.property
    }

    pub fn scope(&self) -> ColumnScope {
        match self.access {
            ColumnAccess::Source { .. } => ColumnScope::Source,
            ColumnAccess::Group { .. } => ColumnScope::Group,
        }
    }

    pub fn compute_source(&self, source: &mut Source) -> Result<()> {
        match &self.access {
            ColumnAccess::Source { compute, .. } => compute(source),
            ColumnAccess::Group { .. } => Ok(()),
        }
    }

    pub fn compute_group(&self, group: &mut SourceGroup) -> Result<()> {
        match &self.access {
            ColumnAccess::Group { compute, .. } => compute(group),
            ColumnAccess::Source { .. } => Ok(()),
        }
    }

    pub fn value(&self, group: &SourceGroup, source: &Source) -> ColumnValue {
        match &self.access {
            ColumnAccess::Source { read, .. } => read(source),
            ColumnAccess::Group { read, .. } => read(group),
        }
    }
}

/// Ordered set of catalog columns.
#[derive(Clone, Debug, Default)]
pub struct OutputRegistry {
    columns: Vec<OutputColumn>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, column: OutputColumn) -> Result<()> {
        if self.column(column.name()).is_some() {
            return Err(Error::Config(format!(
                "output column '{}' registered twice",
                column.name()
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&OutputColumn> {
        self.columns.iter().find(|column| column.name() == name)
    }

    pub fn columns(&self) -> &[OutputColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name()).collect()
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &OutputColumn> {
        self.columns
            .iter()
            .filter(|column| column.scope() == ColumnScope::Source)
    }

    pub fn group_columns(&self) -> impl Iterator<Item = &OutputColumn> {
        self.columns
            .iter()
            .filter(|column| column.scope() == ColumnScope::Group)
    }

    /// The named columns in the given order; every column when `names` is
    /// empty.
    pub fn select(&self, names: &[String]) -> Result<OutputRegistry> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        let mut selected = OutputRegistry::new();
        for name in names {
            let column = self.column(name).ok_or_else(|| {
                Error::Config(format!(
                    "unknown output column '{}', available: {}",
                    name,
                    self.column_names().join(", ")
                ))
            })?;
            selected.register(column.clone())?;
        }
        Ok(selected)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Values of one catalog row.
    pub fn row(&self, group: &SourceGroup, source: &Source) -> Vec<ColumnValue> {
        self.columns
            .iter()
            .map(|column| column.value(group, source))
            .collect()
    }
}

/// Final consumer of measured groups, in canonical order.
pub trait OutputSink: Send {
    fn name(&self) -> &'static str;

    fn write_group(&mut self, group: &SourceGroup) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogRow {
    pub values: Vec<(String, ColumnValue)>,
    pub failures: Vec<Failure>,
}

impl CatalogRow {
    pub fn get(&self, name: &str) -> Option<ColumnValue> {
        self.values
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| *value)
    }
}

pub type SharedRows = Arc<Mutex<Vec<CatalogRow>>>;

/// Keeps every row in memory; the rows stay readable through
/// [`CollectingSink::rows`] after the sink moved into a pipeline.
#[derive(Debug)]
pub struct CollectingSink {
    columns: Arc<OutputRegistry>,
    rows: SharedRows,
}

impl CollectingSink {
    pub fn new(columns: Arc<OutputRegistry>) -> Self {
        Self {
            columns,
            rows: SharedRows::default(),
        }
    }

    pub fn rows(&self) -> SharedRows {
        self.rows.clone()
    }
}

impl OutputSink for CollectingSink {
    fn name(&self) -> &'static str {
        "collect"
    }

    fn write_group(&mut self, group: &SourceGroup) -> Result<()> {
        let mut rows = self.rows.lock();
        for source in group.sources() {
            let values = self
                .columns
                .columns()
                .iter()
                .map(|column| (column.name().to_string(), column.value(group, source)))
                .collect();
            rows.push(CatalogRow {
                values,
                failures: source.failures().to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityFactory;
    use crate::plugins::detection::SourceId;
    use crate::task::{TaskFactoryRegistry, TaskResolver};

    fn registry() -> OutputRegistry {
        let mut outputs = OutputRegistry::new();
        outputs
            .register(OutputColumn::source::<SourceId, _>("SOURCE_ID", 0, |id| {
                ColumnValue::Int(id.0 as i64)
            }))
            .unwrap();
        outputs
            .register(OutputColumn::source::<SourceId, _>("HALF_ID", 0, |id| {
                ColumnValue::Float(id.0 as f64 / 2.0)
            }))
            .unwrap();
        outputs
    }

    #[test]
    fn duplicate_column_name_is_rejected() {
        let mut outputs = registry();
        let err = outputs
            .register(OutputColumn::source::<SourceId, _>("SOURCE_ID", 0, |_| {
                ColumnValue::Missing
            }))
            .unwrap_err();
        assert!(err.to_string().contains("SOURCE_ID"));
    }

    #[test]
    fn select_keeps_requested_order() {
        let outputs = registry();
        let selected = outputs
            .select(&["HALF_ID".to_string(), "SOURCE_ID".to_string()])
            .unwrap();
        assert_eq!(selected.column_names(), ["HALF_ID", "SOURCE_ID"]);
        assert_eq!(outputs.select(&[]).unwrap().len(), 2);
        assert!(outputs.select(&["NOPE".to_string()]).is_err());
    }

    #[test]
    fn values_are_read_without_computing() {
        let factory = EntityFactory::new(TaskResolver::new(TaskFactoryRegistry::new()));
        let mut group = factory.create_group();
        let mut stored = factory.create_source();
        stored.set_property(SourceId(4));
        group.add_source(stored);
        group.add_source(factory.create_source());

        let outputs = Arc::new(registry());
        let mut sink = CollectingSink::new(outputs);
        let rows = sink.rows();
        sink.write_group(&group).unwrap();

        let rows = rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("SOURCE_ID"), Some(ColumnValue::Int(4)));
        assert_eq!(rows[0].get("HALF_ID"), Some(ColumnValue::Float(2.0)));
        assert_eq!(rows[1].get("SOURCE_ID"), Some(ColumnValue::Missing));
    }

    #[test]
    fn column_value_formatting() {
        assert_eq!(ColumnValue::Int(-3).to_string(), "-3");
        assert_eq!(ColumnValue::Float(1.5).to_string(), "1.500000");
        assert_eq!(ColumnValue::Missing.to_string(), "nan");
    }
}
