use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::collector::EvaluationRun;
use crate::metrics_engine::{IndicatorReport, MetricsReport};
use crate::types::Indicator;

const FAILED_IDS_IN_REPORT: usize = 20;

#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub predictions: PathBuf,
    pub metrics: PathBuf,
    pub failures: PathBuf,
    pub report: PathBuf,
}

/// Writes the artifacts of one run into a directory, all sharing a timestamp suffix.
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[tracing::instrument(skip_all, fields(output_dir = %self.output_dir.display()))]
    pub async fn write(
        &self,
        run_id: &str,
        run: &EvaluationRun,
        metrics: &MetricsReport,
    ) -> Result<OutputFiles> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let now = Local::now();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let files = OutputFiles {
            predictions: self.output_dir.join(format!("predictions_{stamp}.json")),
            metrics: self.output_dir.join(format!("metrics_{stamp}.json")),
            failures: self.output_dir.join(format!("failed_{stamp}.json")),
            report: self.output_dir.join(format!("report_{stamp}.md")),
        };

        write_json(&files.predictions, &run.records).await?;
        write_json(&files.metrics, metrics).await?;
        write_json(&files.failures, &run.failures).await?;
        tokio::fs::write(&files.report, render_markdown(run_id, now, run, metrics))
            .await
            .with_context(|| format!("Failed to write {}", files.report.display()))?;

        tracing::info!(
            predictions = %files.predictions.display(),
            metrics = %files.metrics.display(),
            failures = %files.failures.display(),
            report = %files.report.display(),
            "Results saved"
        );
        Ok(files)
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize output")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Human-readable summary of a run.
pub fn render_markdown(
    run_id: &str,
    generated_at: DateTime<Local>,
    run: &EvaluationRun,
    metrics: &MetricsReport,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Tongue Vision Model Baseline Test Report\n");
    let _ = writeln!(out, "Date: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Run: {run_id}\n");

    let _ = writeln!(out, "## Overall Performance\n");
    match metrics.overall.accuracy {
        Some(accuracy) => {
            let _ = writeln!(out, "Overall Accuracy: {accuracy:.4}");
            let _ = writeln!(out, "Sample Count: {}\n", metrics.overall.sample_count);
        }
        None => {
            let _ = writeln!(out, "No valid samples found for overall accuracy calculation.\n");
        }
    }

    let _ = writeln!(out, "## Performance by Indicator\n");
    for indicator in Indicator::ALL {
        let _ = writeln!(out, "### {indicator}\n");
        match metrics.indicators.get(&indicator) {
            Some(IndicatorReport::Scored(scores)) => {
                let _ = writeln!(out, "Accuracy: {:.4}", scores.accuracy);
                let _ = writeln!(out, "Sample Count: {}", scores.sample_count);
                let _ = writeln!(out, "Precision (Macro): {:.4}", scores.precision_macro);
                let _ = writeln!(out, "Recall (Macro): {:.4}", scores.recall_macro);
                let _ = writeln!(out, "F1 Score (Macro): {:.4}\n", scores.f1_macro);
                let _ = writeln!(out, "| Class | Precision | Recall | F1 Score | Support |");
                let _ = writeln!(out, "|-------|-----------|--------|----------|---------|");
                for (class, m) in &scores.per_class {
                    let _ = writeln!(
                        out,
                        "| {class} | {:.4} | {:.4} | {:.4} | {} |",
                        m.precision, m.recall, m.f1_score, m.support
                    );
                }
            }
            Some(IndicatorReport::Failed(failure)) => {
                let _ = writeln!(out, "Error calculating metrics: {}", failure.error);
            }
            None => {
                let _ = writeln!(out, "No valid predictions found for this indicator.");
            }
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Failed Samples\n");
    let _ = writeln!(out, "Failed: {} of {}", run.failures.len(), run.total());
    if !run.failures.is_empty() {
        out.push('\n');
        for failure in run.failures.iter().take(FAILED_IDS_IN_REPORT) {
            let _ = writeln!(
                out,
                "- {} ({}): {}",
                failure.sample_id,
                failure.reason.as_str(),
                failure.message
            );
        }
        if run.failures.len() > FAILED_IDS_IN_REPORT {
            let _ = writeln!(out, "- ... and {} more", run.failures.len() - FAILED_IDS_IN_REPORT);
        }
    }
    out
}
