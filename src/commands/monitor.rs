//! Monitoring CLI commands.

use std::collections::BTreeSet;
use std::error::Error;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use lakegraph::config::LakegraphConfig;
use lakegraph::monitoring::{
    CachedModelLoader, JsonModelLoader, ModelKey, RollingStatsEngine, StatFlags, StatsFrame,
    ensure_predictions, read_inferences, read_reference, write_reference,
};

/// Monitor action subcommands.
#[derive(clap::Subcommand)]
pub enum MonitorAction {
    /// Compute rolling statistics over an inference log.
    Compute {
        /// Labeled reference set (Parquet).
        #[arg(long)]
        reference: PathBuf,

        /// Inference log (Parquet).
        #[arg(long)]
        inferences: PathBuf,

        /// Output statistics frame (Parquet).
        #[arg(long)]
        out: PathBuf,

        /// Window length in days; defaults to `monitoring.window_size`.
        #[arg(short, long)]
        window: Option<usize>,

        /// Also write one CSV per metric into this directory.
        #[arg(long)]
        render: Option<PathBuf>,

        /// Models as `name/version`; defaults to every model in the log.
        #[arg(short, long = "model")]
        models: Vec<String>,

        /// Directory of `{name}/{version}.json` models used to score the
        /// reference set when it lacks predictions.
        #[arg(long)]
        models_dir: Option<PathBuf>,

        /// Comma-separated statistic groups.
        #[arg(long)]
        stats: Option<StatFlags>,

        /// First date included.
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Last date included.
        #[arg(long)]
        until: Option<NaiveDate>,
    },

    /// Print a stored statistics frame.
    Show {
        /// Statistics frame (Parquet).
        frame: PathBuf,
    },
}

/// Execute a monitor command.
///
/// # Errors
///
/// Returns an error if an input cannot be read or a statistic cannot be computed.
pub fn cmd_monitor(config: &LakegraphConfig, action: MonitorAction) -> Result<(), Box<dyn Error>> {
    match action {
        MonitorAction::Compute {
            reference,
            inferences,
            out,
            window,
            render,
            models,
            models_dir,
            stats,
            since,
            until,
        } => {
            let mut monitoring = config.monitoring.clone().with_range(since, until);
            if let Some(window) = window {
                monitoring.window_size = window;
            }
            if let Some(stats) = stats {
                monitoring.flags = stats;
            }
            let engine = RollingStatsEngine::new(monitoring)?;

            let records = read_inferences(&inferences)?;
            let models = if models.is_empty() {
                records
                    .iter()
                    .map(lakegraph::InferenceRecord::model)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            } else {
                models
                    .iter()
                    .map(|m| m.parse())
                    .collect::<lakegraph::Result<Vec<ModelKey>>>()?
            };

            let mut reference_set = read_reference(&reference)?;
            if let Some(dir) = models_dir {
                score_reference(&mut reference_set, &models, &dir, &reference)?;
            }

            let frame = engine.compute(&reference_set, &records, &models)?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            frame.store(&out)?;
            println!(
                "Wrote {} rows for {} models to {}",
                frame.len(),
                frame.models().len(),
                out.display()
            );

            if let Some(dir) = render {
                for path in frame.render(&dir, frame.metrics())? {
                    println!("Rendered {}", path.display());
                }
            }
            Ok(())
        },
        MonitorAction::Show { frame } => {
            let frame = StatsFrame::load(&frame)?;
            print_frame(&frame);
            Ok(())
        },
    }
}

/// Scores the reference set with any model it lacks predictions for and
/// writes it back to `path`.
fn score_reference(
    reference: &mut lakegraph::ReferenceSet,
    models: &[ModelKey],
    dir: &Path,
    path: &Path,
) -> Result<(), Box<dyn Error>> {
    let loader = CachedModelLoader::new(
        Box::new(JsonModelLoader::new(dir)),
        CachedModelLoader::DEFAULT_CAPACITY,
    );
    let scored = ensure_predictions(reference, models, &loader)?;
    if !scored.is_empty() {
        write_reference(path, reference)?;
        for model in scored {
            println!("Scored reference set with {model}");
        }
    }
    Ok(())
}

fn print_frame(frame: &StatsFrame) {
    let header: Vec<&str> = frame.metrics().iter().map(|m| m.as_str()).collect();
    println!("{:<12} {:<24} {}", "date", "model", header.join("  "));
    for row in frame.rows() {
        let values: Vec<String> = row
            .values
            .iter()
            .map(|v| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}")))
            .collect();
        println!("{:<12} {:<24} {}", row.date, row.model.to_string(), values.join("  "));
    }
}
