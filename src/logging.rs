//! Tracing setup: a leveled stderr layer, plus an optional non-blocking
//! file layer for each of the `gcode` and `tcp` targets that is
//! otherwise silent on stderr — the direct analogue of the source
//! tool's two `propagate=False` named loggers.

use std::fs::OpenOptions;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

/// Verbosity resolved from `-v`/`-vv`/`-q` flag counts. Quiet wins over
/// any number of `-v`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
}

impl Verbosity {
    pub fn from_counts(verbose: u8, quiet: bool) -> Self {
        if quiet {
            return Verbosity::Quiet;
        }
        match verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            _ => Verbosity::VeryVerbose,
        }
    }

    fn max_level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::VeryVerbose => Level::TRACE,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global tracing subscriber. Returns the appender guards
/// the caller must keep alive for the process lifetime — dropping one
/// stops flushing that file.
pub fn init_tracing(
    verbosity: Verbosity,
    gcode_log_file: Option<&Path>,
    tcp_log_file: Option<&Path>,
) -> anyhow::Result<Vec<WorkerGuard>> {
    let max_level = verbosity.max_level();
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter_fn(move |meta| {
                *meta.level() <= max_level && meta.target() != "gcode" && meta.target() != "tcp"
            }))
            .boxed(),
    );

    if let Some(path) = gcode_log_file {
        let (layer, guard) = target_file_layer(path, "gcode")?;
        layers.push(layer);
        guards.push(guard);
    }
    if let Some(path) = tcp_log_file {
        let (layer, guard) = target_file_layer(path, "tcp")?;
        layers.push(layer);
        guards.push(guard);
    }

    tracing::subscriber::set_global_default(Registry::default().with(layers))?;
    Ok(guards)
}

fn target_file_layer(path: &Path, target: &'static str) -> anyhow::Result<(BoxedLayer, WorkerGuard)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter_fn(move |meta| meta.target() == target))
        .boxed();
    Ok((layer, guard))
}
