//! Per-indicator classification scores and whole-sample accuracy.
//!
//! Classes for an indicator are the union of labels seen in ground truth and
//! predictions. A class with no predictions has precision 0, a class with no
//! support has recall 0, and F1 is 0 whenever precision + recall is 0.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::label::MISSING_LABEL;
use crate::types::{EvaluationRecord, Indicator, Labels};

#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("no samples to score")]
    NoSamples,

    #[error("label sequences differ in length ({truth} ground truth vs {predicted} predicted)")]
    LengthMismatch { truth: usize, predicted: usize },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndicatorMetrics {
    pub accuracy: f64,
    pub sample_count: usize,
    pub precision_macro: f64,
    pub recall_macro: f64,
    pub f1_macro: f64,
    pub per_class: BTreeMap<String, ClassMetrics>,
}

/// Entry for an indicator whose scores could not be computed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndicatorFailure {
    pub accuracy: Option<f64>,
    pub sample_count: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum IndicatorReport {
    Scored(IndicatorMetrics),
    Failed(IndicatorFailure),
}

impl IndicatorReport {
    pub fn accuracy(&self) -> Option<f64> {
        match self {
            IndicatorReport::Scored(metrics) => Some(metrics.accuracy),
            IndicatorReport::Failed(failure) => failure.accuracy,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            IndicatorReport::Scored(metrics) => metrics.sample_count,
            IndicatorReport::Failed(failure) => failure.sample_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OverallMetrics {
    pub accuracy: Option<f64>,
    pub sample_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Serialized as one flat object keyed by indicator name plus `"overall"`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsReport {
    #[serde(flatten)]
    pub indicators: BTreeMap<Indicator, IndicatorReport>,
    pub overall: OverallMetrics,
}

/// Scores completed records. Only reads the records.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    indicators: Vec<Indicator>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self {
            indicators: Indicator::ALL.to_vec(),
        }
    }
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    pub fn evaluate(&self, records: &[EvaluationRecord]) -> MetricsReport {
        let indicators = self
            .indicators
            .iter()
            .map(|&indicator| {
                let truth: Vec<&str> = records
                    .iter()
                    .map(|r| label_of(&r.ground_truth, indicator))
                    .collect();
                let predicted: Vec<&str> = records
                    .iter()
                    .map(|r| label_of(&r.predictions, indicator))
                    .collect();

                let report = match classification_metrics(&truth, &predicted) {
                    Ok(metrics) => IndicatorReport::Scored(metrics),
                    Err(e) => {
                        tracing::warn!(indicator = %indicator, error = %e, "Could not calculate metrics");
                        IndicatorReport::Failed(IndicatorFailure {
                            accuracy: None,
                            sample_count: truth.len(),
                            error: e.to_string(),
                        })
                    }
                };
                (indicator, report)
            })
            .collect();

        MetricsReport {
            indicators,
            overall: self.overall(records),
        }
    }

    fn overall(&self, records: &[EvaluationRecord]) -> OverallMetrics {
        if records.is_empty() {
            return OverallMetrics {
                accuracy: None,
                sample_count: 0,
                note: Some("No valid samples found".to_string()),
            };
        }

        let correct = records
            .iter()
            .filter(|record| {
                self.indicators.iter().all(|&indicator| {
                    label_of(&record.ground_truth, indicator)
                        == label_of(&record.predictions, indicator)
                })
            })
            .count();

        OverallMetrics {
            accuracy: Some(correct as f64 / records.len() as f64),
            sample_count: records.len(),
            note: None,
        }
    }
}

fn label_of(labels: &Labels, indicator: Indicator) -> &str {
    labels
        .get(&indicator)
        .map(String::as_str)
        .unwrap_or(MISSING_LABEL)
}

/// Accuracy, macro averages and per-class breakdown for parallel label
/// sequences.
pub fn classification_metrics(
    truth: &[&str],
    predicted: &[&str],
) -> Result<IndicatorMetrics, MetricsError> {
    if truth.len() != predicted.len() {
        return Err(MetricsError::LengthMismatch {
            truth: truth.len(),
            predicted: predicted.len(),
        });
    }
    if truth.is_empty() {
        return Err(MetricsError::NoSamples);
    }

    let classes: BTreeSet<&str> = truth.iter().chain(predicted).copied().collect();

    let mut per_class = BTreeMap::new();
    let mut correct = 0usize;
    for &class in &classes {
        let mut true_positives = 0usize;
        let mut predicted_count = 0usize;
        let mut support = 0usize;
        for (&t, &p) in truth.iter().zip(predicted) {
            let is_true = t == class;
            let is_pred = p == class;
            support += usize::from(is_true);
            predicted_count += usize::from(is_pred);
            true_positives += usize::from(is_true && is_pred);
        }
        correct += true_positives;

        let precision = ratio(true_positives, predicted_count);
        let recall = ratio(true_positives, support);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        per_class.insert(
            class.to_string(),
            ClassMetrics {
                precision,
                recall,
                f1_score,
                support,
            },
        );
    }

    let class_count = per_class.len() as f64;
    let macro_avg = |f: fn(&ClassMetrics) -> f64| per_class.values().map(f).sum::<f64>() / class_count;

    Ok(IndicatorMetrics {
        accuracy: correct as f64 / truth.len() as f64,
        sample_count: truth.len(),
        precision_macro: macro_avg(|m| m.precision),
        recall_macro: macro_avg(|m| m.recall),
        f1_macro: macro_avg(|m| m.f1_score),
        per_class,
    })
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
