//! Error types for the extraction engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::entity::EntityId;
use crate::parameter::ParameterId;

/// Errors raised by the extraction engine.
///
/// Only [`Error::Measurement`] and [`Error::InvalidCoordinates`] are
/// recoverable: they describe a problem with one entity's data and are
/// absorbed by the measurement stage. Everything else aborts the run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No task registered for property '{name}' (instance {instance})")]
    UnknownProperty { name: &'static str, instance: u32 },

    #[error("Task for property '{name}' (instance {instance}) finished without producing it")]
    PropertyNotProduced { name: &'static str, instance: u32 },

    #[error("Dependency cycle while computing entity {entity}: {chain}")]
    DependencyCycle { entity: EntityId, chain: String },

    #[error("Property '{name}' is produced by more than one task factory")]
    DuplicateTaskFactory { name: &'static str },

    #[error("Parameter {parameter} depends on undeclared parameter {dependee}")]
    UndeclaredDependee {
        parameter: ParameterId,
        dependee: ParameterId,
    },

    #[error("Parameter {parameter} was never added for entity {entity}")]
    UnknownParameter {
        entity: EntityId,
        parameter: ParameterId,
    },

    #[error("Pixel ({x}, {y}) is outside image '{image}' of {width}x{height}")]
    OutOfBounds {
        image: String,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },

    #[error("Failed to load tile ({x}, {y}) {width}x{height} from '{image}': {source}")]
    TileLoad {
        image: String,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write back tile ({x}, {y}) {width}x{height} to '{image}': {source}")]
    TileWriteBack {
        image: String,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        #[source]
        source: io::Error,
    },

    #[error("{count} modified tile(s) lost on eviction, first at ({x}, {y}) of '{image}'")]
    TilesLost {
        count: usize,
        image: String,
        x: usize,
        y: usize,
    },

    #[error("Invalid measurement for '{property}': {reason}")]
    Measurement {
        property: &'static str,
        reason: String,
    },

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Ordering stall: expected key {expected} never arrived (buffered: {available})")]
    OrderingStall { expected: u64, available: String },

    #[error("Ordering keys delivered more than once: {ranges}")]
    DuplicateKey { ranges: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Configuration section '{0}' is not used by any loaded plugin")]
    UnknownConfigSection(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yml::Error),

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Output sink '{sink}' failed: {source}")]
    Output {
        sink: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Malformed bypass file '{path}': {reason}")]
    Bypass { path: PathBuf, reason: String },

    #[error("Pipeline stage '{stage}' lost its downstream channel")]
    ChannelClosed { stage: &'static str },

    #[error("Pipeline stage '{stage}' did not complete: {message}")]
    StageJoin { stage: &'static str, message: String },

    #[error("Run aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for per-entity data problems that must not stop the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Measurement { .. } | Error::InvalidCoordinates(_))
    }

    /// Copy of a recoverable error, used to answer repeated requests for a
    /// property whose computation already failed.
    pub(crate) fn replay(&self) -> Error {
        match self {
            Error::Measurement { property, reason } => Error::Measurement {
                property: *property,
                reason: reason.clone(),
            },
            Error::InvalidCoordinates(reason) => Error::InvalidCoordinates(reason.clone()),
            other => Error::Measurement {
                property: "unknown",
                reason: other.to_string(),
            },
        }
    }

    /// True for errors that only echo a failure that happened elsewhere.
    pub(crate) fn is_secondary(&self) -> bool {
        matches!(self, Error::Aborted | Error::ChannelClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_property_message() {
        let err = Error::UnknownProperty {
            name: "PixelCentroid",
            instance: 2,
        };
        assert_eq!(
            err.to_string(),
            "No task registered for property 'PixelCentroid' (instance 2)"
        );
    }

    #[test]
    fn tile_load_keeps_context_and_source() {
        use std::error::Error as StdError;

        let err = Error::TileLoad {
            image: "detection.raw".to_string(),
            x: 256,
            y: 512,
            width: 256,
            height: 128,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "short read"),
        };
        let msg = err.to_string();
        assert!(msg.contains("detection.raw"));
        assert!(msg.contains("(256, 512)"));
        assert!(msg.contains("256x128"));
        assert!(msg.contains("short read"));
        assert!(err.source().is_some());
    }

    #[test]
    fn ordering_stall_message() {
        let err = Error::OrderingStall {
            expected: 3,
            available: "[4..=5]".to_string(),
        };
        assert!(err.to_string().contains("expected key 3"));
        assert!(err.to_string().contains("[4..=5]"));
    }

    #[test]
    fn only_data_errors_are_recoverable() {
        assert!(Error::Measurement {
            property: "PixelCentroid",
            reason: "no flux".to_string()
        }
        .is_recoverable());
        assert!(Error::InvalidCoordinates("pole".to_string()).is_recoverable());
        assert!(!Error::Aborted.is_recoverable());
        assert!(!Error::Config("bad".to_string()).is_recoverable());
    }
}
