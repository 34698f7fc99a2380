//! Wires configuration, task factories, stages and the output sink into
//! one run.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::bypass::{RecoverBypass, StoreBypass};
use crate::config::{Config, FrameConfig};
use crate::coordinates::AffineCoordinates;
use crate::entity::{EntityFactory, SourceGroup};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::output::{OutputRegistry, OutputSink};
use crate::pipeline::deblending::{DeblendAction, Deblending};
use crate::pipeline::grouping::{GroupingCriteria, OverlappingBoundariesCriteria, SourceGrouping};
use crate::pipeline::measurement::{spawn_measurement, Measurement};
use crate::pipeline::partition::{MinAreaStep, Partition, PartitionStep};
use crate::pipeline::segmentation::{spawn_segmentation, Segmentation, ThresholdSegmentation};
use crate::pipeline::sorter::Sorter;
use crate::pipeline::{
    first_cause, join_stage, spawn_sink, spawn_stage, AbortSignal, SinkTotals, StageHandle,
};
use crate::progress::{ProgressMediator, ProgressObserver};
use crate::task::{TaskFactoryRegistry, TaskResolver};
use crate::tile::{RawFileSource, TileStats, TileStore, TiledImage};

/// What a finished run produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Sources emitted by segmentation, or replayed from a bypass file.
    pub sources_detected: u64,
    pub groups_emitted: u64,
    pub sources_emitted: u64,
    /// Recoverable measurement failures recorded on emitted sources.
    pub failures: u64,
    pub tile_stats: TileStats,
}

/// Opens a raw image described by `config` and registers it in `store`.
pub fn load_frame(store: &Arc<TileStore>, config: &FrameConfig, threshold: f64) -> Result<Frame> {
    let source = RawFileSource::open(&config.path, config.pixel_kind, config.width, config.height)
        .map_err(|source| Error::Io {
            path: config.path.clone(),
            source,
        })?;
    let id = store.register(Arc::new(source));
    let image = TiledImage::new(store.clone(), id)?;
    Ok(Frame::new(image)
        .with_background(config.background)
        .with_threshold(threshold)
        .with_gain(config.gain)
        .with_saturation(config.saturation)
        .with_coordinates(Arc::new(AffineCoordinates::offset(
            config.offset_x,
            config.offset_y,
        ))))
}

/// One configured extraction run.
pub struct Extraction {
    config: Config,
    factory: Arc<EntityFactory>,
    outputs: Arc<OutputRegistry>,
    segmentation: Option<Box<dyn Segmentation>>,
    partition_steps: Vec<Box<dyn PartitionStep>>,
    grouping: Box<dyn GroupingCriteria>,
    deblend_actions: Vec<Box<dyn DeblendAction>>,
    progress: Arc<ProgressMediator>,
    abort: AbortSignal,
}

impl Extraction {
    /// Validates `config`, configures every factory and selects the output
    /// columns named in `output.columns`.
    pub fn new(config: Config, mut registry: TaskFactoryRegistry, outputs: &OutputRegistry) -> Result<Self> {
        config.validate()?;
        registry.configure(&config)?;
        let outputs = Arc::new(outputs.select(&config.output.columns)?);
        let factory = EntityFactory::new(TaskResolver::new(registry));
        let min_area = config.detection.min_area;

        tracing::info!(
            columns = outputs.len(),
            threads = config.pipeline.effective_thread_count(),
            "extraction configured"
        );

        Ok(Self {
            config,
            factory,
            outputs,
            segmentation: None,
            partition_steps: vec![Box::new(MinAreaStep::new(min_area))],
            grouping: Box::new(OverlappingBoundariesCriteria::default()),
            deblend_actions: Vec::new(),
            progress: ProgressMediator::new(),
            abort: AbortSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> &Arc<EntityFactory> {
        &self.factory
    }

    pub fn outputs(&self) -> &Arc<OutputRegistry> {
        &self.outputs
    }

    pub fn progress(&self) -> &Arc<ProgressMediator> {
        &self.progress
    }

    /// Handle that aborts the run from outside.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn with_segmentation(mut self, segmentation: Box<dyn Segmentation>) -> Self {
        self.segmentation = Some(segmentation);
        self
    }

    pub fn with_partition_step(mut self, step: Box<dyn PartitionStep>) -> Self {
        self.partition_steps.push(step);
        self
    }

    pub fn with_grouping(mut self, grouping: Box<dyn GroupingCriteria>) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_deblend_action(mut self, action: Box<dyn DeblendAction>) -> Self {
        self.deblend_actions.push(action);
        self
    }

    pub fn with_progress_observer(self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress.add_observer(observer);
        self
    }

    /// Detects, measures and writes every source of `detection`.
    pub async fn run(mut self, detection: Arc<Frame>, sink: Box<dyn OutputSink>) -> Result<RunSummary> {
        let store_bypass = match &self.config.output.store_bypass {
            Some(path) => Some(StoreBypass::create(path)?),
            None => None,
        };
        let first_source_id = self.config.pipeline.first_source_id;
        let abort = self.abort.clone();

        let segmentation: Box<dyn Segmentation> = match self.segmentation.take() {
            Some(segmentation) => segmentation,
            None => Box::new(
                ThresholdSegmentation::new(self.config.detection.progress_interval_rows)
                    .with_progress(self.progress.clone()),
            ),
        };
        tracing::info!(
            frame = %detection.label,
            width = detection.width(),
            height = detection.height(),
            "extraction started"
        );

        let (rx, segmentation_handle) =
            spawn_segmentation(segmentation, detection.clone(), self.factory.clone(), abort.clone());
        let partition = Partition::new(std::mem::take(&mut self.partition_steps));
        let (rx, partition_handle) = spawn_stage(partition, rx, abort.clone());
        let grouping = SourceGrouping::new(
            std::mem::replace(&mut self.grouping, Box::new(OverlappingBoundariesCriteria::default())),
            self.factory.clone(),
        );
        let (rx, grouping_handle) = spawn_stage(grouping, rx, abort.clone());
        let deblending = Deblending::new(std::mem::take(&mut self.deblend_actions), first_source_id);
        let (mut rx, deblending_handle) = spawn_stage(deblending, rx, abort.clone());

        let mut handles: Vec<(&'static str, StageHandle)> = vec![
            ("partition", partition_handle),
            ("grouping", grouping_handle),
            ("deblending", deblending_handle),
        ];
        if let Some(bypass) = store_bypass {
            let (bypass_rx, handle) = spawn_stage(bypass, rx, abort.clone());
            rx = bypass_rx;
            handles.push(("store_bypass", handle));
        }

        let mut errors = Vec::new();
        let detected = self
            .measure_and_output(
                rx,
                first_source_id,
                sink,
                handles,
                &mut errors,
                join_stage("segmentation", segmentation_handle),
            )
            .await;

        self.teardown(&detection, detected, errors)
    }

    /// Replays a stored bypass file instead of detecting and grouping.
    pub async fn run_recovered(
        self,
        path: impl AsRef<Path>,
        detection: Arc<Frame>,
        sink: Box<dyn OutputSink>,
    ) -> Result<RunSummary> {
        let bypass = RecoverBypass::open(path)?;
        let first_source_id = bypass
            .first_source_id()
            .unwrap_or(self.config.pipeline.first_source_id);
        tracing::info!(
            groups = bypass.groups().len(),
            sources = bypass.source_count(),
            "extraction started from bypass"
        );

        let (rx, replay_handle) = bypass.spawn(
            self.factory.clone(),
            detection.clone(),
            self.abort.clone(),
            Some(self.progress.clone()),
        );
        let mut errors = Vec::new();
        let detected = self
            .measure_and_output(
                rx,
                first_source_id,
                sink,
                Vec::new(),
                &mut errors,
                join_stage("recover_bypass", replay_handle),
            )
            .await;

        self.teardown(&detection, detected, errors)
    }

    /// Runs measurement, sorting and output on `rx`, then joins every stage
    /// including `upstream`. Returns the upstream count and the sink totals.
    async fn measure_and_output(
        &self,
        rx: UnboundedReceiver<SourceGroup>,
        first_source_id: u64,
        sink: Box<dyn OutputSink>,
        handles: Vec<(&'static str, StageHandle)>,
        errors: &mut Vec<Error>,
        upstream: impl std::future::Future<Output = Result<u64>>,
    ) -> (u64, SinkTotals) {
        let abort = self.abort.clone();
        let measurement = Measurement::new(
            self.outputs.clone(),
            self.config.pipeline.effective_thread_count(),
        )
        .with_progress(self.progress.clone());
        let (rx, measurement_handle) = spawn_measurement(measurement, rx, abort.clone());
        let sorter = Sorter::new(first_source_id).with_progress(self.progress.clone());
        let (rx, sorter_handle) = spawn_stage(sorter, rx, abort.clone());
        let sink_handle = spawn_sink(sink, rx, abort);

        let detected = collect(upstream.await, errors).unwrap_or(0);
        for (stage, handle) in handles {
            collect(join_stage(stage, handle).await, errors);
        }
        collect(join_stage("measurement", measurement_handle).await, errors);
        collect(join_stage("sorter", sorter_handle).await, errors);
        let totals = collect(join_stage("output", sink_handle).await, errors).unwrap_or_default();
        (detected, totals)
    }

    fn teardown(
        &self,
        detection: &Frame,
        (detected, totals): (u64, SinkTotals),
        mut errors: Vec<Error>,
    ) -> Result<RunSummary> {
        let store = detection.image.store();
        if let Err(err) = store.flush() {
            tracing::error!(error = %err, "tile flush failed at teardown");
            errors.push(err);
        }
        self.progress.done();

        if let Some(err) = first_cause(errors) {
            tracing::error!(error = %err, "extraction failed");
            return Err(err);
        }

        let summary = RunSummary {
            sources_detected: detected,
            groups_emitted: totals.groups,
            sources_emitted: totals.sources,
            failures: totals.failures,
            tile_stats: store.stats(),
        };
        tracing::info!(
            detected = summary.sources_detected,
            groups = summary.groups_emitted,
            sources = summary.sources_emitted,
            failures = summary.failures,
            "extraction finished"
        );
        Ok(summary)
    }
}

fn collect<T>(result: Result<T>, errors: &mut Vec<Error>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            errors.push(err);
            None
        }
    }
}
