use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The five tongue features scored for every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    CoatingLabel,
    TaiLabel,
    ZhiLabel,
    FissureLabel,
    ToothMkLabel,
}

impl Indicator {
    pub const ALL: [Indicator; 5] = [
        Indicator::CoatingLabel,
        Indicator::TaiLabel,
        Indicator::ZhiLabel,
        Indicator::FissureLabel,
        Indicator::ToothMkLabel,
    ];

    /// Column / JSON key used by the dataset and the classifier response.
    pub fn key(self) -> &'static str {
        match self {
            Indicator::CoatingLabel => "coating_label",
            Indicator::TaiLabel => "tai_label",
            Indicator::ZhiLabel => "zhi_label",
            Indicator::FissureLabel => "fissure_label",
            Indicator::ToothMkLabel => "tooth_mk_label",
        }
    }

    /// Nominal label options offered to the classifier.
    pub fn label_options(self) -> &'static [&'static str] {
        match self {
            Indicator::CoatingLabel => &["greasy", "greasy_thick", "non_greasy"],
            Indicator::TaiLabel => &["white", "light_yellow", "yellow"],
            Indicator::ZhiLabel => &["regular", "dark", "light"],
            Indicator::FissureLabel | Indicator::ToothMkLabel => &["NaN", "light", "severe"],
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|indicator| indicator.key() == key)
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Raw (not yet normalized) labels keyed by indicator. `None` means absent.
pub type RawLabels = BTreeMap<Indicator, Option<String>>;

/// Normalized labels, one entry per indicator.
pub type Labels = BTreeMap<Indicator, String>;

/// Where a task's image lives. `Unresolved` means the dataset had no image for the sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Path(PathBuf),
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub sample_id: String,
    pub image: ImageRef,
    pub ground_truth: RawLabels,
}

/// Labels parsed out of a classifier response. Indicators the response did
/// not mention are present with a `None` value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    pub labels: RawLabels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRecord {
    #[serde(rename = "SID")]
    pub sample_id: String,
    pub ground_truth: Labels,
    pub predictions: Labels,
    pub raw_response: String,
}

/// Coarse failure class, serialized into the failure dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Resolution,
    Transport,
    Parse,
    DuplicateSample,
    WorkerAborted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Resolution => "resolution",
            FailureReason::Transport => "transport",
            FailureReason::Parse => "parse",
            FailureReason::DuplicateSample => "duplicate_sample",
            FailureReason::WorkerAborted => "worker_aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    #[serde(rename = "SID")]
    pub sample_id: String,
    pub reason: FailureReason,
    pub message: String,
}

/// What a worker reports back for one task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(EvaluationRecord),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn sample_id(&self) -> &str {
        match self {
            TaskOutcome::Completed(record) => &record.sample_id,
            TaskOutcome::Failed(failure) => &failure.sample_id,
        }
    }
}
