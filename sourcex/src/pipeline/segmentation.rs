//! Detection of connected above-threshold pixel regions.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::{AbortSignal, Emitter, SegmentationProgress, SourceMessage};
use crate::entity::{Entity, EntityFactory};
use crate::error::Result;
use crate::frame::Frame;
use crate::plugins::detection::{DetectionFrame, DetectionId, PixelCoordinate, PixelCoordinateList};
use crate::progress::ProgressMediator;

pub const PROGRESS_LABEL: &str = "Segmentation";

/// Strategy turning a detection frame into a stream of sources.
///
/// Implementations interleave [`SourceMessage::Progress`] with the sources
/// and end with a done progress message.
pub trait Segmentation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the number of sources emitted.
    fn scan(
        &mut self,
        frame: &Arc<Frame>,
        factory: &EntityFactory,
        out: &Emitter<SourceMessage>,
        abort: &AbortSignal,
    ) -> Result<u64>;
}

pub fn spawn_segmentation(
    mut segmentation: Box<dyn Segmentation>,
    frame: Arc<Frame>,
    factory: Arc<EntityFactory>,
    abort: AbortSignal,
) -> (UnboundedReceiver<SourceMessage>, JoinHandle<Result<u64>>) {
    let (tx, rx) = unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        let out = Emitter::new(segmentation.name(), tx);
        let result = segmentation.scan(&frame, &factory, &out, &abort);
        match &result {
            Ok(count) => tracing::info!(sources = count, frame = %frame.label, "segmentation done"),
            Err(err) => {
                if !err.is_secondary() {
                    tracing::error!(error = %err, "segmentation failed");
                }
                abort.abort();
            }
        }
        result
    });
    (rx, handle)
}

// ============================================================================
// Threshold segmentation
// ============================================================================

/// Horizontal run `[start, end)` of detected pixels with its provisional label.
#[derive(Clone, Copy, Debug)]
struct Run {
    start: usize,
    end: usize,
    label: u32,
}

impl Run {
    /// 8-connectivity between runs of adjacent rows.
    fn touches(&self, other: &Run) -> bool {
        other.start <= self.end && other.end + 1 > self.start
    }
}

#[derive(Debug)]
struct Component {
    first_row: usize,
    last_row: usize,
    pixels: Vec<PixelCoordinate>,
}

/// Streaming union-find labelling: components stay open while they keep
/// growing and are handed out once a row passes without touching them.
#[derive(Debug, Default)]
struct Labeller {
    parent: Vec<u32>,
    open: HashMap<u32, Component>,
}

impl Labeller {
    fn new_label(&mut self, row: usize) -> u32 {
        let label = self.parent.len() as u32;
        self.parent.push(label);
        self.open.insert(
            label,
            Component {
                first_row: row,
                last_row: row,
                pixels: Vec::new(),
            },
        );
        label
    }

    fn find(&mut self, mut label: u32) -> u32 {
        while self.parent[label as usize] != label {
            let grandparent = self.parent[self.parent[label as usize] as usize];
            self.parent[label as usize] = grandparent;
            label = grandparent;
        }
        label
    }

    fn union(&mut self, a: u32, b: u32) -> u32 {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return a;
        }
        let (root, merged) = if a < b { (a, b) } else { (b, a) };
        self.parent[merged as usize] = root;
        if let Some(other) = self.open.remove(&merged) {
            if let Some(component) = self.open.get_mut(&root) {
                component.first_row = component.first_row.min(other.first_row);
                component.last_row = component.last_row.max(other.last_row);
                component.pixels.extend(other.pixels);
            }
        }
        root
    }

    fn add_run(&mut self, label: u32, run: &Run, row: usize) {
        let root = self.find(label);
        if let Some(component) = self.open.get_mut(&root) {
            component.last_row = row;
            component
                .pixels
                .extend((run.start..run.end).map(|x| PixelCoordinate::new(x as i64, row as i64)));
        }
    }

    /// Removes the components that did not grow on `row`, or all of them.
    fn take_closed(&mut self, row: Option<usize>) -> Vec<Component> {
        let labels: Vec<u32> = self
            .open
            .iter()
            .filter(|(_, component)| row.map_or(true, |row| component.last_row < row))
            .map(|(&label, _)| label)
            .collect();
        let mut closed: Vec<Component> = labels
            .into_iter()
            .filter_map(|label| self.open.remove(&label))
            .collect();
        for component in &mut closed {
            component.pixels.sort_unstable_by_key(|p| (p.y, p.x));
        }
        closed.sort_unstable_by_key(|component| {
            component.pixels.first().map(|p| (p.y, p.x))
        });
        closed
    }

    fn lowest_open_row(&self) -> Option<usize> {
        self.open.values().map(|component| component.first_row).min()
    }
}

fn extract_runs(row: &[f64], level: f64) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut start = None;
    for (x, &value) in row.iter().enumerate() {
        match (value > level, start) {
            (true, None) => start = Some(x),
            (false, Some(begin)) => {
                runs.push(Run {
                    start: begin,
                    end: x,
                    label: 0,
                });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = start {
        runs.push(Run {
            start: begin,
            end: row.len(),
            label: 0,
        });
    }
    runs
}

/// Marks pixels brighter than `background + threshold` of the frame and
/// groups them into 8-connected regions, scanning the image one row at a
/// time through the tile store.
#[derive(Debug)]
pub struct ThresholdSegmentation {
    progress_interval_rows: usize,
    progress: Option<Arc<ProgressMediator>>,
}

impl ThresholdSegmentation {
    pub fn new(progress_interval_rows: usize) -> Self {
        Self {
            progress_interval_rows: progress_interval_rows.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressMediator>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit_components(
        components: Vec<Component>,
        frame: &Arc<Frame>,
        factory: &EntityFactory,
        out: &Emitter<SourceMessage>,
        next_detection: &mut u64,
    ) -> Result<()> {
        for component in components {
            let mut source = factory.create_source();
            source.set_property(DetectionId(*next_detection));
            source.set_property(PixelCoordinateList::new(component.pixels));
            source.set_property(DetectionFrame {
                frame: frame.clone(),
            });
            *next_detection += 1;
            out.emit(SourceMessage::Source(source))?;
        }
        Ok(())
    }
}

impl Segmentation for ThresholdSegmentation {
    fn name(&self) -> &'static str {
        "segmentation"
    }

    fn scan(
        &mut self,
        frame: &Arc<Frame>,
        factory: &EntityFactory,
        out: &Emitter<SourceMessage>,
        abort: &AbortSignal,
    ) -> Result<u64> {
        let height = frame.height();
        let level = frame.background + frame.threshold;
        let mut labeller = Labeller::default();
        let mut previous: Vec<Run> = Vec::new();
        let mut next_detection = 1u64;

        tracing::debug!(
            frame = %frame.label,
            width = frame.width(),
            height,
            level,
            "segmentation started"
        );

        for y in 0..height {
            abort.check()?;
            let row = frame.image.read_row(y)?;
            let mut runs = extract_runs(&row, level);

            for run in &mut runs {
                let mut label = None;
                for above in previous.iter().filter(|above| run.touches(above)) {
                    label = Some(match label {
                        None => labeller.find(above.label),
                        Some(current) => labeller.union(current, above.label),
                    });
                }
                run.label = match label {
                    Some(label) => label,
                    None => labeller.new_label(y),
                };
                labeller.add_run(run.label, run, y);
            }
            previous = runs;

            let closed = labeller.take_closed(Some(y));
            Self::emit_components(closed, frame, factory, out, &mut next_detection)?;

            if (y + 1) % self.progress_interval_rows == 0 && y + 1 < height {
                let position = labeller.lowest_open_row().unwrap_or(y + 1);
                out.emit(SourceMessage::Progress(SegmentationProgress {
                    position,
                    total: height,
                }))?;
                if let Some(progress) = &self.progress {
                    progress.update(PROGRESS_LABEL, (y + 1) as i64, height as i64);
                }
            }
        }

        let remaining = labeller.take_closed(None);
        Self::emit_components(remaining, frame, factory, out, &mut next_detection)?;
        out.emit(SourceMessage::Progress(SegmentationProgress::done(height)))?;
        if let Some(progress) = &self.progress {
            progress.update(PROGRESS_LABEL, height as i64, height as i64);
        }

        Ok(next_detection - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_split_on_threshold() {
        let runs = extract_runs(&[0.0, 5.0, 5.0, 0.0, 5.0, 1.0, 5.0], 1.0);
        let spans: Vec<_> = runs.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(spans, [(1, 3), (4, 5), (6, 7)]);
    }

    #[test]
    fn diagonal_runs_touch() {
        let a = Run {
            start: 2,
            end: 4,
            label: 0,
        };
        let diagonal = Run {
            start: 4,
            end: 6,
            label: 0,
        };
        let apart = Run {
            start: 5,
            end: 6,
            label: 0,
        };
        assert!(a.touches(&diagonal));
        assert!(diagonal.touches(&a));
        assert!(!a.touches(&apart));
    }

    #[test]
    fn union_merges_open_components() {
        let mut labeller = Labeller::default();
        let a = labeller.new_label(0);
        let b = labeller.new_label(1);
        labeller.add_run(
            a,
            &Run {
                start: 0,
                end: 2,
                label: a,
            },
            0,
        );
        labeller.add_run(
            b,
            &Run {
                start: 5,
                end: 6,
                label: b,
            },
            1,
        );
        let root = labeller.union(b, a);
        assert_eq!(root, a);
        assert_eq!(labeller.find(b), a);
        assert_eq!(labeller.open.len(), 1);
        assert_eq!(labeller.lowest_open_row(), Some(0));

        let closed = labeller.take_closed(Some(2));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].pixels.len(), 3);
        assert_eq!(closed[0].last_row, 1);
    }
}
