//! Income Anomaly Pipeline - Main Entry Point
//!
//! Ingests income transactions and profiles from NATS, answers single
//! classification requests and periodically sweeps the whole population,
//! publishing every outcome to the review queue.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use income_anomaly_pipeline::{
    config::{AppConfig, LoggingConfig},
    consumer::{decode, ClassifyRequest, IngestConsumer},
    feature_extractor::extractor_schema,
    metrics::{MetricsReporter, PipelineMetrics},
    producer::ResultProducer,
    source::InMemoryTransactionSource,
    types::{PersonProfile, ReviewOutcome},
    ClassificationPipeline, ScoringEngine, Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("income_anomaly_pipeline={}", logging.level))
    })?;

    if logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;

    info!("Starting Income Anomaly Pipeline");
    info!(
        evaluation_months = config.features.evaluation_months,
        baseline_months = config.baseline.window_months,
        utc_offset_minutes = config.calendar.utc_offset_minutes,
        "Configuration loaded"
    );

    // No model, no service
    let engine = Arc::new(
        ScoringEngine::load(&config.model.artifact_path, extractor_schema())
            .with_context(|| format!("Failed to load model from {}", config.model.artifact_path))?,
    );
    let model = engine.snapshot();
    info!(
        version = %model.version(),
        scorer = model.scorer_kind(),
        operating_threshold = model.operating_threshold(),
        threshold_override = ?config.model.threshold_override,
        "Scoring model ready"
    );

    let metrics = Arc::new(PipelineMetrics::new());
    let ledger = Arc::new(InMemoryTransactionSource::new());
    let pipeline = Arc::new(
        ClassificationPipeline::new(ledger.clone(), engine.clone(), &config).with_metrics(metrics.clone()),
    );
    info!(
        features = pipeline.extractor().feature_count(),
        "Classification pipeline initialized"
    );

    let client = async_nats::connect(&config.nats.url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats.url))?;
    info!("Connected to NATS at {}", config.nats.url);

    let consumer = IngestConsumer::new(client.clone(), &config.nats);
    let producer = ResultProducer::new(client.clone(), &config.nats.review_subject);
    info!("Publishing review outcomes to: {}", producer.subject());

    // Start metrics reporter (prints summary every 30 seconds)
    let reporter_metrics = metrics.clone();
    tokio::spawn(async move {
        MetricsReporter::new(reporter_metrics, 30).start().await;
    });

    // Profiles
    let mut profiles = consumer.subscribe_profiles().await?;
    let profile_ledger = ledger.clone();
    tokio::spawn(async move {
        while let Some(message) = profiles.next().await {
            match decode::<PersonProfile>(&message.payload) {
                Ok(profile) => {
                    debug!(person_id = %profile.person_id, "Profile updated");
                    profile_ledger.upsert_profile(profile);
                }
                Err(e) => warn!(error = %e, "Dropping malformed profile"),
            }
        }
    });

    // Single classification requests
    let mut requests = consumer.subscribe_requests().await?;
    let semaphore = Arc::new(Semaphore::new(config.pipeline.workers.max(1)));
    let calendar = config.calendar.calendar();
    {
        let pipeline = pipeline.clone();
        let producer = producer.clone();
        tokio::spawn(async move {
            while let Some(message) = requests.next().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let pipeline = pipeline.clone();
                let producer = producer.clone();

                tokio::spawn(async move {
                    let request = match decode::<ClassifyRequest>(&message.payload) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed classification request");
                            return;
                        }
                    };
                    let window_end = request.window_end_or_default(&calendar, Utc::now());
                    let person_id = request.person_id.clone();

                    let outcome = match tokio::task::spawn_blocking(move || {
                        pipeline.review(&request.person_id, window_end)
                    })
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => ReviewOutcome::ManualReview {
                            person_id,
                            window_end,
                            reason: format!("classification worker failed: {}", e),
                        },
                    };

                    if let Some(reply_to) = message.reply {
                        if let Err(e) = producer.reply(reply_to, &outcome).await {
                            error!(person_id = %outcome.person_id(), error = %e, "Failed to reply");
                        }
                    }
                    if let Err(e) = producer.publish(&outcome).await {
                        error!(person_id = %outcome.person_id(), error = %e, "Failed to publish review outcome");
                    }
                    drop(permit);
                });
            }
        });
    }

    // Periodic full-population sweep
    {
        let pipeline = pipeline.clone();
        let producer = producer.clone();
        let period = Duration::from_secs(config.pipeline.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; give ingestion a head start
            interval.tick().await;
            loop {
                interval.tick().await;
                let window_end = calendar.current_month_start(Utc::now());
                let run = match pipeline.reclassify_all(window_end) {
                    Ok(run) => run,
                    Err(e) => {
                        error!(error = %e, "Sweep failed to start");
                        continue;
                    }
                };

                let (mut outcomes, handle) = run.into_stream();
                while let Some(person) = outcomes.next().await {
                    if let Err(e) = producer.publish(&person.outcome).await {
                        error!(person_id = %person.person_id, error = %e, "Failed to publish review outcome");
                    }
                }
                match handle.await {
                    Ok(summary) => info!(
                        window_end = %summary.window_end,
                        people = summary.people,
                        anomalies = summary.anomalies,
                        manual_review = summary.manual_review,
                        skipped = summary.skipped,
                        timed_out = summary.timed_out,
                        "Sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Sweep coordinator failed"),
                }
            }
        });
    }

    // Reload the model artifact on SIGHUP
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangups = signal(SignalKind::hangup())?;
        let engine = engine.clone();
        let artifact_path = config.model.artifact_path.clone();
        tokio::spawn(async move {
            while hangups.recv().await.is_some() {
                let engine = engine.clone();
                let path = artifact_path.clone();
                match tokio::task::spawn_blocking(move || engine.reload_from(&path)).await {
                    Ok(Ok(model)) => info!(version = %model.version(), "Model reloaded"),
                    Ok(Err(e)) => error!(error = %e, "Model reload rejected; keeping current model"),
                    Err(e) => error!(error = %e, "Model reload task failed"),
                }
            }
        });
    }

    // Transactions
    let mut transactions = consumer.subscribe_transactions().await?;
    info!(
        workers = config.pipeline.workers,
        "Listening for transactions on {}", config.nats.transaction_subject
    );

    loop {
        tokio::select! {
            message = transactions.next() => {
                let Some(message) = message else { break };
                let tx = match decode::<Transaction>(&message.payload) {
                    Ok(tx) => tx,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed transaction");
                        continue;
                    }
                };

                if !ledger.record(tx.clone()) {
                    debug!(transaction_id = %tx.id, "Duplicate transaction ignored");
                    continue;
                }
                if let Err(e) = pipeline.ingest(&tx) {
                    warn!(transaction_id = %tx.id, person_id = %tx.person_id, error = %e, "Failed to ingest transaction");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}
