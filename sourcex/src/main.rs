use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::log_setup::{setup_logging, ConsoleTarget};

use sourcex::output::{AsciiCatalog, OutputRegistry, OutputSink};
use sourcex::plugins::{register_default_columns, register_default_plugins};
use sourcex::progress::{ProgressLogger, ProgressPrinter};
use sourcex::task::TaskFactoryRegistry;
use sourcex::tile::TileStore;
use sourcex::{load_frame, Config, Extraction};

const USAGE: &str = "usage: sourcex <config.yaml> | sourcex --list-output-columns [config.yaml]";

/// Console logs stay off stdout whenever stdout carries the catalog or the
/// column list.
fn console_target(catalog_path: Option<&Path>, list_columns: bool) -> ConsoleTarget {
    if list_columns || catalog_path.is_none() {
        ConsoleTarget::Stderr
    } else {
        ConsoleTarget::Stdout
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (list_columns, config_path) = match args.as_slice() {
        [flag] if flag == "--list-output-columns" => (true, None),
        [flag, path] if flag == "--list-output-columns" => (true, Some(path.clone())),
        [path] => (false, Some(path.clone())),
        _ => bail!(USAGE),
    };

    let config = match &config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    setup_logging(
        "info",
        "logs",
        "sourcex",
        console_target(config.output.path.as_deref(), list_columns),
    );

    let store = TileStore::new(config.tiles.clone());
    let mut measurement_frames = Vec::new();
    for frame in &config.input.measurement {
        measurement_frames.push(Arc::new(load_frame(&store, frame, config.detection.threshold)?));
    }
    let frame_count = measurement_frames.len() as u32;

    let mut registry = TaskFactoryRegistry::new();
    register_default_plugins(&mut registry, measurement_frames)?;
    let mut outputs = OutputRegistry::new();
    register_default_columns(&mut outputs, frame_count)?;

    if list_columns {
        for name in outputs.column_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let detection_config = config
        .input
        .detection
        .clone()
        .context("input.detection is required")?;
    let detection = Arc::new(load_frame(&store, &detection_config, config.detection.threshold)?);
    let recover = config.output.recover_bypass.clone();
    let catalog_path = config.output.path.clone();

    let extraction = Extraction::new(config, registry, &outputs)?
        .with_progress_observer(Arc::new(ProgressLogger))
        .with_progress_observer(Arc::new(ProgressPrinter::new(
            std::io::stderr(),
            Duration::from_secs(1),
        )));

    let columns = extraction.outputs().clone();
    let sink: Box<dyn OutputSink> = match &catalog_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create catalog '{}'", path.display()))?;
            Box::new(AsciiCatalog::new(BufWriter::new(file), columns))
        }
        None => Box::new(AsciiCatalog::new(std::io::stdout(), columns)),
    };

    let summary = match recover {
        Some(path) => extraction.run_recovered(path, detection, sink).await?,
        None => extraction.run(detection, sink).await?,
    };

    tracing::info!(
        sources = summary.sources_emitted,
        groups = summary.groups_emitted,
        failures = summary.failures,
        tile_loads = summary.tile_stats.loads,
        tile_evictions = summary.tile_stats.evictions,
        "done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_on_stdout_moves_logs_to_stderr() {
        assert_eq!(console_target(None, false), ConsoleTarget::Stderr);
        assert_eq!(console_target(Some(Path::new("out.cat")), true), ConsoleTarget::Stderr);
        assert_eq!(console_target(Some(Path::new("out.cat")), false), ConsoleTarget::Stdout);
    }
}
