//! Property computation for every output column, on a bounded worker pool.
//!
//! Groups are measured concurrently and leave the stage in completion
//! order; the sorter downstream restores canonical order.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{AbortSignal, Emitter, StageHandle};
use crate::entity::{Entity, SourceGroup};
use crate::error::{Error, Result};
use crate::output::OutputRegistry;
use crate::progress::ProgressMediator;

pub const PROGRESS_LABEL: &str = "Measured";

pub struct Measurement {
    outputs: Arc<OutputRegistry>,
    thread_count: usize,
    progress: Option<Arc<ProgressMediator>>,
}

impl Measurement {
    pub fn new(outputs: Arc<OutputRegistry>, thread_count: usize) -> Self {
        Self {
            outputs,
            thread_count: thread_count.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressMediator>) -> Self {
        self.progress = Some(progress);
        self
    }
}

pub fn spawn_measurement(
    measurement: Measurement,
    rx: UnboundedReceiver<SourceGroup>,
    abort: AbortSignal,
) -> (UnboundedReceiver<SourceGroup>, StageHandle) {
    let (tx, out_rx) = unbounded_channel();
    let handle = tokio::spawn(async move {
        let out = Emitter::new("measurement", tx);
        let result = run_measurement(measurement, rx, &out, &abort).await;
        if let Err(err) = &result {
            if !err.is_secondary() {
                tracing::error!(stage = "measurement", error = %err, "stage failed");
            }
            abort.abort();
        }
        result
    });
    (out_rx, handle)
}

async fn run_measurement(
    measurement: Measurement,
    mut rx: UnboundedReceiver<SourceGroup>,
    out: &Emitter<SourceGroup>,
    abort: &AbortSignal,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(measurement.thread_count));
    let mut jobs: JoinSet<Result<SourceGroup>> = JoinSet::new();
    let mut input_open = true;
    let mut failure: Option<Error> = None;
    let mut measured = 0i64;

    tracing::debug!(workers = measurement.thread_count, "measurement started");

    loop {
        let accepting = input_open && failure.is_none();
        tokio::select! {
            msg = rx.recv(), if accepting => {
                let Some(group) = msg else {
                    input_open = false;
                    continue;
                };
                if abort.is_aborted() {
                    failure = Some(Error::Aborted);
                    continue;
                }
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Aborted)?;
                let outputs = measurement.outputs.clone();
                jobs.spawn_blocking(move || {
                    let _permit = permit;
                    measure_group(group, &outputs)
                });
            }
            Some(joined) = jobs.join_next() => {
                let result = joined.unwrap_or_else(|err| {
                    Err(Error::StageJoin {
                        stage: "measurement",
                        message: err.to_string(),
                    })
                });
                match result {
                    Ok(group) if failure.is_none() => {
                        measured += group.len() as i64;
                        if let Some(progress) = &measurement.progress {
                            progress.update(PROGRESS_LABEL, measured, -1);
                        }
                        if let Err(err) = out.emit(group) {
                            failure = Some(err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        abort.abort();
                        failure.get_or_insert(err);
                    }
                }
            }
            else => break,
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    abort.check()?;
    tracing::debug!(sources = measured, "measurement finished");
    Ok(())
}

/// Computes every registered column for the group and each of its sources.
///
/// Access tracking is reset per entity before its columns are computed.
/// Recoverable errors are logged and recorded on the entity; the column
/// stays empty.
pub fn measure_group(mut group: SourceGroup, outputs: &OutputRegistry) -> Result<SourceGroup> {
    group.clear_access_check();
    let mut attempted = BTreeSet::new();
    for column in outputs.group_columns() {
        if attempted.insert(column.property()) {
            let result = column.compute_group(&mut group);
            absorb(&mut group, column.property().name(), result)?;
        }
    }

    for source in group.sources_mut() {
        source.clear_access_check();
        attempted.clear();
        for column in outputs.source_columns() {
            if attempted.insert(column.property()) {
                let result = column.compute_source(source);
                absorb(source, column.property().name(), result)?;
            }
        }
    }
    Ok(group)
}

fn absorb<E: Entity>(entity: &mut E, property: &'static str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_recoverable() => {
            tracing::warn!(entity = %entity.id(), property, error = %err, "measurement failed");
            entity.record_failure(property, err.to_string());
            Ok(())
        }
        Err(err) => Err(err),
    }
}
