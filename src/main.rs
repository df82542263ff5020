use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use tongue_eval::client::{ChatCompletionsClient, ChatCompletionsConfig, FsImageLoader};
use tongue_eval::config::{Config, DispatchConfig, RateLimitConfig};
use tongue_eval::dataset::Dataset;
use tongue_eval::parser::FirstObjectParser;
use tongue_eval::report::ReportWriter;
use tongue_eval::{MetricsEngine, RateLimiter, TaskDispatcher};

const FAILED_IDS_IN_SUMMARY: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tongue_eval=debug".into());
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    config.validate()?;
    let Some(api_key) = config.resolved_api_key() else {
        anyhow::bail!("DASHSCOPE_API_KEY is not set; pass --api-key or set the environment variable");
    };

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        tracing::info!("Serving counters on http://{addr}/metrics");
    }

    let run_id = Uuid::new_v4().simple().to_string();
    let span = tracing::info_span!("evaluation", run_id = %run_id);
    run(config, api_key, run_id).instrument(span).await
}

async fn run(config: Config, api_key: String, run_id: String) -> anyhow::Result<()> {
    tracing::info!(
        max_concurrent_requests = config.max_concurrent_requests,
        max_calls_per_second = config.max_calls_per_second,
        sample_limit = ?config.sample_limit,
        model = %config.model,
        "Starting evaluation"
    );

    let dataset = Dataset::load(&config.data_dir)?;
    let tasks = dataset.tasks(config.sample_limit);
    let submitted = tasks.len();

    let client = ChatCompletionsClient::new(ChatCompletionsConfig {
        base_url: config.base_url.clone(),
        api_key,
        model: config.model.clone(),
        timeout: config.request_timeout(),
        max_tokens: 500,
        temperature: 0.2,
    })?;

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config)));
    let dispatcher = TaskDispatcher::new(
        DispatchConfig::from(&config),
        limiter,
        Arc::new(client),
        Arc::new(FsImageLoader),
        Arc::new(FirstObjectParser),
    );

    let evaluation = dispatcher.run(tasks).await;
    let metrics = MetricsEngine::new().evaluate(&evaluation.records);

    let failed_ids = evaluation.failed_ids();
    tracing::info!(
        submitted,
        completed = evaluation.records.len(),
        failed = failed_ids.len(),
        "Evaluation finished"
    );
    if !failed_ids.is_empty() {
        tracing::warn!(
            sample = ?&failed_ids[..failed_ids.len().min(FAILED_IDS_IN_SUMMARY)],
            "Failed sample IDs"
        );
    }
    match metrics.overall.accuracy {
        Some(accuracy) => tracing::info!(
            accuracy,
            samples = metrics.overall.sample_count,
            "Overall accuracy"
        ),
        None => tracing::warn!("No completed samples, overall accuracy unavailable"),
    }

    ReportWriter::new(config.output_dir.clone())
        .write(&run_id, &evaluation, &metrics)
        .await?;
    Ok(())
}
