//! Sourcex - data engine for astronomical source extraction.
//!
//! The crate provides:
//! - A tiled pixel cache over images larger than memory
//! - Lazily computed, memoized entity properties with dependency tracking
//! - A detect → partition → group → deblend → measure → sort → output
//!   pipeline that emits sources in canonical order
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sourcex::prelude::*;
//!
//! let config = Config::from_file("sourcex.yaml")?;
//! let store = TileStore::new(config.tiles.clone());
//! let detection = Arc::new(load_frame(&store, &frame_config, config.detection.threshold)?);
//!
//! let mut registry = TaskFactoryRegistry::new();
//! register_default_plugins(&mut registry, Vec::new())?;
//! let mut outputs = OutputRegistry::new();
//! register_default_columns(&mut outputs, 0)?;
//!
//! let extraction = Extraction::new(config, registry, &outputs)?;
//! let sink = AsciiCatalog::new(std::io::stdout(), extraction.outputs().clone());
//! let summary = extraction.run(detection, Box::new(sink)).await?;
//! ```

pub mod bypass;
pub mod config;
pub mod coordinates;
pub mod entity;
pub mod error;
pub mod extraction;
pub mod frame;
pub mod output;
pub mod parameter;
pub mod pipeline;
pub mod plugins;
pub mod progress;
pub mod property;
pub mod task;
pub mod tile;

pub mod prelude;

// ============================================================================
// Core types
// ============================================================================

pub use config::Config;
pub use entity::{Entity, EntityFactory, EntityId, Source, SourceGroup};
pub use error::{Error, Result};
pub use frame::Frame;
pub use property::{Property, PropertyId, PropertyKind};

// ============================================================================
// Run driver
// ============================================================================

pub use extraction::{load_frame, Extraction, RunSummary};
