//! Run progress: stages report `(current, total)` per label, observers
//! render the table.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// Label → `(current, total)`. A negative total means unbounded.
pub type ProgressInfo = BTreeMap<String, (i64, i64)>;

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, info: &ProgressInfo, elapsed: Duration);

    /// Called once when the run ends.
    fn on_done(&self, info: &ProgressInfo, elapsed: Duration) {
        self.on_progress(info, elapsed);
    }
}

/// Collects progress updates from every stage and fans them out.
pub struct ProgressMediator {
    started: Instant,
    info: Mutex<ProgressInfo>,
    observers: RwLock<Vec<Arc<dyn ProgressObserver>>>,
}

impl fmt::Debug for ProgressMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMediator")
            .field("info", &*self.info.lock())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl ProgressMediator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            info: Mutex::new(ProgressInfo::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers.write().push(observer);
    }

    pub fn update(&self, label: &str, current: i64, total: i64) {
        let snapshot = {
            let mut info = self.info.lock();
            info.insert(label.to_string(), (current, total));
            info.clone()
        };
        let elapsed = self.started.elapsed();
        for observer in self.observers.read().iter() {
            observer.on_progress(&snapshot, elapsed);
        }
    }

    pub fn snapshot(&self) -> ProgressInfo {
        self.info.lock().clone()
    }

    pub fn done(&self) {
        let snapshot = self.snapshot();
        let elapsed = self.started.elapsed();
        for observer in self.observers.read().iter() {
            observer.on_done(&snapshot, elapsed);
        }
    }
}

const BAR_WIDTH: usize = 20;

/// One line for the whole table: a bar for bounded entries, a counter for
/// unbounded ones, then the elapsed time.
pub fn render_progress(info: &ProgressInfo, elapsed: Duration) -> String {
    let mut line = String::new();
    for (label, &(current, total)) in info {
        if total > 0 {
            let ratio = (current as f64 / total as f64).clamp(0.0, 1.0);
            let filled = (ratio * BAR_WIDTH as f64).round() as usize;
            let _ = write!(
                line,
                "{} [{}{}] {:>3}% ",
                label,
                "#".repeat(filled),
                "-".repeat(BAR_WIDTH - filled),
                (ratio * 100.0).round() as i64
            );
        } else {
            let _ = write!(line, "{}: {} ", label, current);
        }
    }
    let _ = write!(line, "({:.1}s)", elapsed.as_secs_f64());
    line
}

/// Writes rendered progress to an injected writer, at most once per
/// `min_interval`.
pub struct ProgressPrinter<W: Write + Send> {
    writer: Mutex<W>,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl<W: Write + Send> ProgressPrinter<W> {
    pub fn new(writer: W, min_interval: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn print(&self, info: &ProgressInfo, elapsed: Duration) {
        let line = render_progress(info, elapsed);
        if let Err(err) = writeln!(self.writer.lock(), "{}", line) {
            tracing::warn!(error = %err, "failed to print progress");
        }
    }
}

impl<W: Write + Send> ProgressObserver for ProgressPrinter<W> {
    fn on_progress(&self, info: &ProgressInfo, elapsed: Duration) {
        let now = Instant::now();
        {
            let mut last = self.last.lock();
            if last.is_some_and(|last| now.duration_since(last) < self.min_interval) {
                return;
            }
            *last = Some(now);
        }
        self.print(info, elapsed);
    }

    fn on_done(&self, info: &ProgressInfo, elapsed: Duration) {
        self.print(info, elapsed);
    }
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct ProgressLogger;

impl ProgressObserver for ProgressLogger {
    fn on_progress(&self, info: &ProgressInfo, elapsed: Duration) {
        tracing::debug!(progress = %render_progress(info, elapsed), "progress");
    }

    fn on_done(&self, info: &ProgressInfo, elapsed: Duration) {
        tracing::info!(progress = %render_progress(info, elapsed), "run finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ProgressInfo>>,
        done: Mutex<bool>,
    }

    impl ProgressObserver for Recorder {
        fn on_progress(&self, info: &ProgressInfo, _elapsed: Duration) {
            self.seen.lock().push(info.clone());
        }

        fn on_done(&self, _info: &ProgressInfo, _elapsed: Duration) {
            *self.done.lock() = true;
        }
    }

    #[test]
    fn mediator_keeps_latest_value_per_label() {
        let mediator = ProgressMediator::new();
        let recorder = Arc::new(Recorder::default());
        mediator.add_observer(recorder.clone());

        mediator.update("Segmentation", 10, 100);
        mediator.update("Measured", 3, -1);
        mediator.update("Segmentation", 50, 100);
        mediator.done();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2]["Segmentation"], (50, 100));
        assert_eq!(seen[2]["Measured"], (3, -1));
        assert!(*recorder.done.lock());
    }

    #[test]
    fn renders_bars_and_counters() {
        let mut info = ProgressInfo::new();
        info.insert("Measured".to_string(), (7, -1));
        info.insert("Segmentation".to_string(), (1, 4));
        let line = render_progress(&info, Duration::from_millis(1500));
        assert_eq!(
            line,
            "Measured: 7 Segmentation [#####---------------]  25% (1.5s)"
        );
    }

    #[test]
    fn printer_throttles_but_always_prints_done() {
        let printer = ProgressPrinter::new(Vec::new(), Duration::from_secs(3600));
        let mut info = ProgressInfo::new();
        info.insert("Sorter buffer".to_string(), (2, -1));

        printer.on_progress(&info, Duration::ZERO);
        printer.on_progress(&info, Duration::ZERO);
        printer.on_done(&info, Duration::from_secs(2));

        let text = String::from_utf8(printer.into_inner()).unwrap();
        assert_eq!(
            text,
            "Sorter buffer: 2 (0.0s)\nSorter buffer: 2 (2.0s)\n"
        );
    }
}
