use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where console log lines are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsoleTarget {
    /// stdout, with warnings and errors duplicated on stderr
    #[default]
    Stdout,
    /// stderr only, leaving stdout free for program output
    Stderr,
}

impl ConsoleTarget {
    fn make_writer(self) -> BoxMakeWriter {
        match self {
            ConsoleTarget::Stdout => {
                BoxMakeWriter::new(std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN)))
            }
            ConsoleTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        }
    }
}

/// Installs console and daily-rolling file logging.
///
/// `RUST_LOG` overrides `base_level`. Console output goes to `console`.
/// Files land in `log_dir` with the `file_prefix` name.
pub fn setup_logging(
    base_level: &str,
    log_dir: impl AsRef<Path>,
    file_prefix: &str,
    console: ConsoleTarget,
) {
    let log_dir = log_dir.as_ref();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(base_level))
        .unwrap_or_else(|e| panic!("Invalid log filter: {}", e));

    std::fs::create_dir_all(log_dir).unwrap_or_else(|e| {
        panic!(
            "Failed to create logs directory {}: {}",
            log_dir.display(),
            e
        )
    });

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .unwrap_or_else(|e| panic!("Failed to create log file appender: {}", e));

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).expect("Logging already initialized");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .with_writer(console.make_writer());

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .unwrap_or_else(|e| panic!("Logger initialization failed: {}", e));
}

/// Installs a plain console subscriber for tests; repeated calls are no-ops.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
