//! End-to-end dispatch and scoring with fake classifiers.
//!
//! Time-sensitive tests run on tokio's paused clock, so the rate-limit
//! assertions are exact rather than tolerance-based.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use tongue_eval::client::{ClassifierClient, ImageLoader};
use tongue_eval::config::{DispatchConfig, RateLimitConfig};
use tongue_eval::error::TaskError;
use tongue_eval::metrics_engine::IndicatorReport;
use tongue_eval::parser::FirstObjectParser;
use tongue_eval::types::{FailureReason, ImageRef, RawLabels};
use tongue_eval::{Indicator, MetricsEngine, RateLimiter, Task, TaskDispatcher};

const GROUND_TRUTH: [(Indicator, &str); 5] = [
    (Indicator::CoatingLabel, "greasy"),
    (Indicator::TaiLabel, "white"),
    (Indicator::ZhiLabel, "regular"),
    (Indicator::FissureLabel, "nan"),
    (Indicator::ToothMkLabel, "light"),
];

/// Serves the sample ID as image bytes so the client knows which sample it sees.
struct MemoryImages {
    images: HashMap<PathBuf, Vec<u8>>,
}

#[async_trait]
impl ImageLoader for MemoryImages {
    async fn load(&self, image: &ImageRef) -> Result<Vec<u8>, TaskError> {
        match image {
            ImageRef::Path(path) => self
                .images
                .get(path)
                .cloned()
                .ok_or(TaskError::ImageUnresolved),
            ImageRef::Unresolved => Err(TaskError::ImageUnresolved),
        }
    }
}

/// Records call start times and the peak number of overlapping calls.
struct InstrumentedClient {
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    wrong_zhi: HashSet<String>,
    failing: HashSet<String>,
}

impl InstrumentedClient {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            wrong_zhi: HashSet::new(),
            failing: HashSet::new(),
        }
    }

    fn sorted_starts(&self) -> Vec<Instant> {
        let mut starts = self.starts.lock().unwrap().clone();
        starts.sort();
        starts
    }
}

#[async_trait]
impl ClassifierClient for InstrumentedClient {
    async fn classify(&self, image: &[u8]) -> Result<String> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_in_flight, Ordering::SeqCst);
        self.starts.lock().unwrap().push(Instant::now());

        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let sample_id = String::from_utf8(image.to_vec())?;
        if self.failing.contains(&sample_id) {
            anyhow::bail!("upstream returned 503");
        }
        let zhi = if self.wrong_zhi.contains(&sample_id) {
            "dark"
        } else {
            "regular"
        };
        Ok(format!(
            "Based on the image, here is the classification:\n\
             {{\"coating_label\": \"greasy\", \"tai_label\": \"white\", \"zhi_label\": \"{zhi}\", \
             \"fissure_label\": null, \"tooth_mk_label\": \"light\"}}\n\
             Let me know if you need more detail."
        ))
    }
}

fn tasks(count: usize) -> (Vec<Task>, MemoryImages) {
    let mut images = HashMap::new();
    let tasks = (0..count)
        .map(|i| {
            let sample_id = format!("S{i:03}");
            let path = PathBuf::from(format!("/images/{sample_id}.jpg"));
            images.insert(path.clone(), sample_id.clone().into_bytes());
            let ground_truth: RawLabels = GROUND_TRUTH
                .iter()
                .map(|&(indicator, label)| (indicator, Some(label.to_string())))
                .collect();
            Task {
                sample_id,
                image: ImageRef::Path(path),
                ground_truth,
            }
        })
        .collect();
    (tasks, MemoryImages { images })
}

fn dispatcher(
    client: Arc<InstrumentedClient>,
    images: MemoryImages,
    max_concurrent: usize,
    max_per_second: usize,
) -> TaskDispatcher {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_concurrent,
        max_per_second,
        min_jitter: Duration::from_millis(50),
        max_jitter: Duration::from_millis(300),
    }));
    TaskDispatcher::new(
        DispatchConfig {
            workers: max_concurrent,
        },
        limiter,
        client,
        Arc::new(images),
        Arc::new(FirstObjectParser),
    )
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_limit() {
    let client = Arc::new(InstrumentedClient::new(Duration::from_millis(800)));
    let (tasks, images) = tasks(40);

    let run = dispatcher(Arc::clone(&client), images, 4, 50).run(tasks).await;

    assert_eq!(run.records.len(), 40);
    assert!(run.failures.is_empty());
    let peak = client.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency {peak}");
    assert!(peak >= 2, "calls should overlap, peak {peak}");
}

#[tokio::test(start_paused = true)]
async fn calls_per_second_never_exceed_limit() {
    let client = Arc::new(InstrumentedClient::new(Duration::from_millis(20)));
    let (tasks, images) = tasks(30);

    let run = dispatcher(Arc::clone(&client), images, 8, 5).run(tasks).await;

    assert_eq!(run.total(), 30);
    let starts = client.sorted_starts();
    assert_eq!(starts.len(), 30);
    for group in starts.windows(6) {
        let span = group[5].duration_since(group[0]);
        assert!(span >= Duration::from_secs(1), "6 calls within {span:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn failures_are_isolated_from_metrics() {
    let mut client = InstrumentedClient::new(Duration::from_millis(100));
    client.failing = ["S002", "S005"].into_iter().map(String::from).collect();
    client.wrong_zhi = ["S000", "S001", "S003"].into_iter().map(String::from).collect();
    let client = Arc::new(client);

    let (mut tasks, images) = tasks(12);
    tasks[11].image = ImageRef::Unresolved;

    let run = dispatcher(Arc::clone(&client), images, 3, 10).run(tasks).await;

    assert_eq!(run.records.len() + run.failures.len(), 12);
    let failed: HashSet<_> = run.failed_ids().into_iter().collect();
    assert_eq!(failed, HashSet::from(["S002", "S005", "S011"]));
    let reasons: HashMap<_, _> = run
        .failures
        .iter()
        .map(|f| (f.sample_id.as_str(), f.reason))
        .collect();
    assert_eq!(reasons["S002"], FailureReason::Transport);
    assert_eq!(reasons["S011"], FailureReason::Resolution);

    // The unresolved sample never reached the classifier.
    assert_eq!(client.sorted_starts().len(), 11);

    let metrics = MetricsEngine::new().evaluate(&run.records);
    // 9 completed samples, 3 of them with the wrong tongue-body colour.
    assert_eq!(metrics.overall.sample_count, 9);
    let overall = metrics.overall.accuracy.unwrap();
    assert!((overall - 6.0 / 9.0).abs() < 1e-9);

    let IndicatorReport::Scored(zhi) = &metrics.indicators[&Indicator::ZhiLabel] else {
        panic!("zhi_label should be scored");
    };
    assert!((zhi.accuracy - 6.0 / 9.0).abs() < 1e-9);
    assert_eq!(zhi.per_class["regular"].support, 9);
    assert_eq!(zhi.per_class["dark"].support, 0);

    // Ground truth "nan" and predicted null meet at the sentinel.
    let IndicatorReport::Scored(fissure) = &metrics.indicators[&Indicator::FissureLabel] else {
        panic!("fissure_label should be scored");
    };
    assert_eq!(fissure.accuracy, 1.0);
    assert!(fissure.per_class.contains_key("NaN"));
}

#[tokio::test(start_paused = true)]
async fn every_task_reports_exactly_once() {
    let client = Arc::new(InstrumentedClient::new(Duration::from_millis(30)));
    let (tasks, images) = tasks(25);
    let expected: HashSet<_> = tasks.iter().map(|t| t.sample_id.clone()).collect();

    let run = dispatcher(client, images, 6, 20).run(tasks).await;

    let mut seen: Vec<_> = run
        .records
        .iter()
        .map(|r| r.sample_id.clone())
        .chain(run.failures.iter().map(|f| f.sample_id.clone()))
        .collect();
    seen.sort();
    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), unique.len());
    assert_eq!(unique, expected);
}
