//! Commonly used types and traits.
//!
//! ```rust,ignore
//! use sourcex::prelude::*;
//! ```

// Core
pub use crate::{Config, Entity, EntityFactory, Error, Frame, Property, Result, Source, SourceGroup};

// Tiles
pub use crate::tile::{
    ComputedSource, MemorySource, PixelKind, PixelSource, RawFileSource, TileStore,
    TileStoreConfig, TiledImage,
};

// Tasks and plugins
pub use crate::plugins::{register_default_columns, register_default_plugins};
pub use crate::task::{TaskFactory, TaskFactoryRegistry, TaskResolver};

// Output and progress
pub use crate::output::{AsciiCatalog, CollectingSink, OutputRegistry, OutputSink};
pub use crate::progress::{ProgressLogger, ProgressMediator, ProgressPrinter};

// Run driver
pub use crate::{load_frame, Extraction, RunSummary};
