//! Classification pipeline: single-person requests and full-population sweeps.
//!
//! A request fetches the person's window and profile, prepares their
//! baseline, extracts features, scores them against one model snapshot and
//! turns the probability into a labelled, explained result. Sweeps run the
//! same path on a bounded pool of blocking workers and stream outcomes back
//! through a bounded channel.

use crate::baseline::{AppendOutcome, BaselineStore};
use crate::classifier::ThresholdClassifier;
use crate::config::{AppConfig, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::explain::ExplanationGenerator;
use crate::feature_extractor::FeatureExtractor;
use crate::metrics::PipelineMetrics;
use crate::models::ScoringEngine;
use crate::source::TransactionSource;
use crate::types::classification::{
    risk_score, ClassificationResult, OutcomeKind, ReviewOutcome, RiskLevel, RiskLevelThresholds,
};
use crate::types::transaction::Transaction;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Final outcome for one person in a sweep
#[derive(Debug, Clone, PartialEq)]
pub struct PersonOutcome {
    pub person_id: String,
    /// Classification attempts made, including retries
    pub attempts: u32,
    pub outcome: ReviewOutcome,
}

/// Tally of a finished sweep
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub window_end: DateTime<Utc>,
    pub people: usize,
    pub anomalies: usize,
    pub normals: usize,
    pub insufficient_data: usize,
    pub manual_review: usize,
    /// Retry attempts scheduled
    pub retried: usize,
    /// People never started because the job timed out
    pub skipped: usize,
    pub timed_out: bool,
}

impl BatchSummary {
    fn new(window_end: DateTime<Utc>, people: usize) -> Self {
        Self {
            window_end,
            people,
            anomalies: 0,
            normals: 0,
            insufficient_data: 0,
            manual_review: 0,
            retried: 0,
            skipped: 0,
            timed_out: false,
        }
    }

    fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Anomaly => self.anomalies += 1,
            OutcomeKind::Normal => self.normals += 1,
            OutcomeKind::InsufficientData => self.insufficient_data += 1,
            OutcomeKind::ManualReview => self.manual_review += 1,
        }
    }

    /// Outcomes delivered
    pub fn completed(&self) -> usize {
        self.anomalies + self.normals + self.insufficient_data + self.manual_review
    }
}

/// A running sweep: outcomes arrive on `results` as people finish
pub struct BatchRun {
    pub results: mpsc::Receiver<PersonOutcome>,
    pub handle: JoinHandle<BatchSummary>,
}

impl BatchRun {
    /// Outcomes as a stream, plus the handle resolving to the summary
    pub fn into_stream(self) -> (impl Stream<Item = PersonOutcome> + Send + Unpin, JoinHandle<BatchSummary>) {
        let mut results = self.results;
        (futures::stream::poll_fn(move |cx| results.poll_recv(cx)), self.handle)
    }

    /// Drain every outcome, then wait for the summary
    pub async fn collect(mut self) -> Result<(Vec<PersonOutcome>, BatchSummary), JoinError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.results.recv().await {
            outcomes.push(outcome);
        }
        let summary = self.handle.await?;
        Ok((outcomes, summary))
    }
}

enum Attempt {
    Done(OutcomeKind),
    Retry(String),
}

/// Orchestrates baseline, features, scoring, threshold and explanations
pub struct ClassificationPipeline {
    source: Arc<dyn TransactionSource>,
    baselines: BaselineStore,
    extractor: FeatureExtractor,
    engine: Arc<ScoringEngine>,
    classifier: ThresholdClassifier,
    explainer: ExplanationGenerator,
    risk_levels: RiskLevelThresholds,
    settings: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
}

impl ClassificationPipeline {
    pub fn new(source: Arc<dyn TransactionSource>, engine: Arc<ScoringEngine>, config: &AppConfig) -> Self {
        let calendar = config.calendar.calendar();
        Self {
            baselines: BaselineStore::new(source.clone(), calendar, config.baseline.window_months),
            source,
            extractor: FeatureExtractor::new(config.features.clone(), calendar),
            engine,
            classifier: ThresholdClassifier::new(config.model.threshold_override),
            explainer: ExplanationGenerator::new(config.explanation.clone()),
            risk_levels: config.risk_levels.clone(),
            settings: config.pipeline.clone(),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn engine(&self) -> &Arc<ScoringEngine> {
        &self.engine
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Fold a transaction the source has already recorded into its person's baseline
    pub fn ingest(&self, tx: &Transaction) -> PipelineResult<AppendOutcome> {
        let outcome = self.baselines.append(tx)?;
        self.metrics.record_ingest(outcome == AppendOutcome::Recomputed);
        Ok(outcome)
    }

    /// Classify one person over the window ending at `window_end`
    pub fn classify(&self, person_id: &str, window_end: DateTime<Utc>) -> PipelineResult<ClassificationResult> {
        let (start, end) = self.extractor.window(window_end)?;
        let transactions = self.source.transactions(person_id, start, end)?;
        let profile = self.source.profile(person_id)?;
        let baseline = self.baselines.ensure(person_id)?;

        let vector = self.extractor.extract(
            person_id,
            window_end,
            &transactions,
            baseline.as_ref(),
            profile.as_ref(),
        )?;

        let model = self.engine.snapshot();
        let probability = model.score(&vector)?;
        let decision = self.classifier.classify(probability, model.operating_threshold());
        let explanation = self.explainer.explain(&vector, decision.label);
        let risk = risk_score(probability, explanation.total_matched);

        debug!(
            person_id = %person_id,
            probability = probability,
            label = ?decision.label,
            flags = ?explanation.flags,
            model = %model.version(),
            "Person classified"
        );

        Ok(ClassificationResult {
            result_id: ClassificationResult::result_id_for(person_id, window_end, model.version()),
            person_id: person_id.to_string(),
            window_end,
            probability,
            label: decision.label,
            confidence: decision.confidence,
            threshold: decision.threshold,
            flags: explanation.flags,
            risk_score: risk,
            risk_level: RiskLevel::from_score(risk, &self.risk_levels),
            model_version: model.version().to_string(),
            observation_count: vector.observation_count,
        })
    }

    /// Classify and map every failure onto a review-queue state.
    ///
    /// Only insufficient data is reported as such; any other error routes
    /// the person to manual review, never to "normal".
    pub fn review(&self, person_id: &str, window_end: DateTime<Utc>) -> ReviewOutcome {
        let started = Instant::now();
        let result = self.classify(person_id, window_end);
        self.finish(person_id, window_end, result, started.elapsed())
    }

    fn finish(
        &self,
        person_id: &str,
        window_end: DateTime<Utc>,
        result: PipelineResult<ClassificationResult>,
        elapsed: Duration,
    ) -> ReviewOutcome {
        let outcome = match result {
            Ok(result) => ReviewOutcome::Classified(result),
            Err(e) if e.is_no_opinion() => {
                debug!(person_id = %person_id, reason = %e, "No classification attempted");
                ReviewOutcome::InsufficientData {
                    person_id: person_id.to_string(),
                    window_end,
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!(person_id = %person_id, error = %e, "Routing to manual review");
                ReviewOutcome::ManualReview {
                    person_id: person_id.to_string(),
                    window_end,
                    reason: e.to_string(),
                }
            }
        };
        self.metrics.record_outcome(&outcome, elapsed);
        outcome
    }

    /// Reclassify everyone the source knows about.
    ///
    /// One person's failure never aborts the sweep. Retryable failures are
    /// retried as a subset up to `max_retries` times. When the job timeout
    /// passes, no new person is started; outcomes already produced have been
    /// sent by then.
    pub fn reclassify_all(self: &Arc<Self>, window_end: DateTime<Utc>) -> PipelineResult<BatchRun> {
        let people = self.source.person_ids()?;
        let (sender, results) = mpsc::channel(self.settings.result_buffer.max(1));
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.run_batch(people, window_end, sender).await });
        Ok(BatchRun { results, handle })
    }

    async fn run_batch(
        self: Arc<Self>,
        people: Vec<String>,
        window_end: DateTime<Utc>,
        sender: mpsc::Sender<PersonOutcome>,
    ) -> BatchSummary {
        let deadline = Instant::now() + Duration::from_millis(self.settings.timeout_ms);
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut summary = BatchSummary::new(window_end, people.len());

        info!(
            people = people.len(),
            window_end = %window_end,
            workers = self.settings.workers,
            model = %self.engine.version(),
            "Batch reclassification started"
        );

        let mut pending = people;
        let mut attempt = 0u32;
        while !pending.is_empty() {
            attempt += 1;
            let may_retry = attempt <= self.settings.max_retries;
            let mut workers = JoinSet::new();
            let mut queue = std::mem::take(&mut pending).into_iter();

            for person_id in queue.by_ref() {
                let permit = if Instant::now() >= deadline {
                    None
                } else {
                    tokio::time::timeout_at(deadline, semaphore.clone().acquire_owned())
                        .await
                        .ok()
                        .and_then(Result::ok)
                };
                let Some(permit) = permit else {
                    summary.timed_out = true;
                    summary.skipped += 1;
                    break;
                };

                let pipeline = Arc::clone(&self);
                let sender = sender.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let worker = Arc::clone(&pipeline);
                    let id = person_id.clone();
                    let result = tokio::task::spawn_blocking(move || worker.classify(&id, window_end))
                        .await
                        .unwrap_or_else(|e| Err(PipelineError::Worker(e.to_string())));

                    match result {
                        Err(e) if e.is_retryable() && may_retry && Instant::now() < deadline => {
                            warn!(person_id = %person_id, attempt, error = %e, "Retryable failure");
                            Attempt::Retry(person_id)
                        }
                        result => {
                            let outcome = pipeline.finish(&person_id, window_end, result, started.elapsed());
                            let kind = outcome.kind();
                            let delivered = PersonOutcome {
                                person_id,
                                attempts: attempt,
                                outcome,
                            };
                            if sender.send(delivered).await.is_err() {
                                debug!("Batch result receiver dropped");
                            }
                            Attempt::Done(kind)
                        }
                    }
                });
            }
            summary.skipped += queue.len();

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Attempt::Done(kind)) => summary.record(kind),
                    Ok(Attempt::Retry(person_id)) => pending.push(person_id),
                    Err(e) => warn!(error = %e, "Batch worker task failed"),
                }
            }
            summary.retried += pending.len();
            pending.sort();
        }

        if summary.timed_out {
            warn!(skipped = summary.skipped, "Batch reclassification timed out");
        }
        info!(
            people = summary.people,
            anomalies = summary.anomalies,
            normals = summary.normals,
            insufficient_data = summary.insufficient_data,
            manual_review = summary.manual_review,
            retried = summary.retried,
            skipped = summary.skipped,
            "Batch reclassification finished"
        );
        summary
    }
}
