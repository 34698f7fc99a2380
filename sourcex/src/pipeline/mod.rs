//! Stage plumbing for the detect → partition → group → deblend → measure →
//! sort → output chain.
//!
//! Every stage runs as its own task reading one unbounded channel and
//! writing the next. Synchronous stages implement [`Stage`] and run on the
//! blocking pool; the measurement stage drives its own worker pool.

pub mod deblending;
pub mod grouping;
pub mod measurement;
pub mod partition;
pub mod segmentation;
pub mod sorter;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::entity::{Entity, Source, SourceGroup};
use crate::error::{Error, Result};
use crate::output::OutputSink;

/// Scan position of the segmentation.
///
/// No source emitted later has a pixel in a row below `position`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentationProgress {
    pub position: usize,
    pub total: usize,
}

impl SegmentationProgress {
    pub fn done(total: usize) -> Self {
        Self {
            position: total,
            total,
        }
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.total
    }
}

#[derive(Debug)]
pub enum SourceMessage {
    Source(Source),
    Progress(SegmentationProgress),
}

/// Run-wide abort flag shared by every stage.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::warn!("abort requested, stages stop accepting work");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }
}

/// Sending half handed to a stage.
#[derive(Debug)]
pub struct Emitter<T> {
    stage: &'static str,
    tx: UnboundedSender<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            tx: self.tx.clone(),
        }
    }
}

impl<T> Emitter<T> {
    pub fn new(stage: &'static str, tx: UnboundedSender<T>) -> Self {
        Self { stage, tx }
    }

    pub fn emit(&self, msg: T) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::ChannelClosed { stage: self.stage })
    }
}

/// One message-driven step of the pipeline.
pub trait Stage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn handle(&mut self, msg: Self::Input, out: &Emitter<Self::Output>) -> Result<()>;

    /// Called once the input channel is closed and drained.
    fn finish(&mut self, _out: &Emitter<Self::Output>) -> Result<()> {
        Ok(())
    }
}

pub type StageHandle = JoinHandle<Result<()>>;

/// Runs `stage` on the blocking pool until its input closes or the run is
/// aborted. A stage error aborts the run.
pub fn spawn_stage<S: Stage>(
    mut stage: S,
    mut rx: UnboundedReceiver<S::Input>,
    abort: AbortSignal,
) -> (UnboundedReceiver<S::Output>, StageHandle) {
    let (tx, out_rx) = unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        let name = stage.name();
        let out = Emitter::new(name, tx);
        let result = run_stage(&mut stage, &mut rx, &out, &abort);
        if let Err(err) = &result {
            if !err.is_secondary() {
                tracing::error!(stage = name, error = %err, "stage failed");
            }
            abort.abort();
        }
        result
    });
    (out_rx, handle)
}

fn run_stage<S: Stage>(
    stage: &mut S,
    rx: &mut UnboundedReceiver<S::Input>,
    out: &Emitter<S::Output>,
    abort: &AbortSignal,
) -> Result<()> {
    while let Some(msg) = rx.blocking_recv() {
        abort.check()?;
        stage.handle(msg, out)?;
    }
    // upstream may have closed because it failed
    abort.check()?;
    tracing::debug!(stage = stage.name(), "input closed, finishing");
    stage.finish(out)
}

/// Totals seen by the output sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkTotals {
    pub groups: u64,
    pub sources: u64,
    pub failures: u64,
}

/// Drains the final channel into `sink`.
pub fn spawn_sink(
    mut sink: Box<dyn OutputSink>,
    mut rx: UnboundedReceiver<SourceGroup>,
    abort: AbortSignal,
) -> JoinHandle<Result<SinkTotals>> {
    tokio::task::spawn_blocking(move || {
        let mut totals = SinkTotals::default();
        match drain_into_sink(sink.as_mut(), &mut rx, &abort, &mut totals) {
            Ok(()) => Ok(totals),
            Err(err) => {
                if !err.is_secondary() {
                    tracing::error!(sink = sink.name(), error = %err, "output failed");
                }
                abort.abort();
                Err(err)
            }
        }
    })
}

fn drain_into_sink(
    sink: &mut dyn OutputSink,
    rx: &mut UnboundedReceiver<SourceGroup>,
    abort: &AbortSignal,
    totals: &mut SinkTotals,
) -> Result<()> {
    while let Some(group) = rx.blocking_recv() {
        abort.check()?;
        sink.write_group(&group)?;
        totals.groups += 1;
        totals.sources += group.len() as u64;
        totals.failures += group
            .sources()
            .iter()
            .map(|source| source.failures().len() as u64)
            .sum::<u64>();
    }
    abort.check()?;
    sink.finish()
}

/// Awaits a stage and folds a panic or cancellation into [`Error::StageJoin`].
pub async fn join_stage<T>(stage: &'static str, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(Error::StageJoin {
            stage,
            message: err.to_string(),
        }),
    }
}

/// Picks the error that caused a failed run: the first one that is not a
/// consequence of another stage failing.
pub fn first_cause(errors: Vec<Error>) -> Option<Error> {
    let mut fallback = None;
    for err in errors {
        if !err.is_secondary() {
            return Some(err);
        }
        fallback.get_or_insert(err);
    }
    fallback
}
