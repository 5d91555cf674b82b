//! Evaluation and optimization loops over dataset splits.
//!
//! [`Trainer::diagnose`] scores a split in inference mode and never touches
//! an optimizable parameter. [`Trainer::fit`] alternates training steps and
//! validation:
//!
//! 1. every sample of the batch runs in training mode, gets a loss node and a
//!    backward pass over its own graph;
//! 2. the feedback each graph collected on pipeline-owned parameters is merged
//!    by the trainer alone;
//! 3. optimizers propose new values, the trainer applies them, scores the
//!    validation split and reverts the proposals unless the score improved.
//!
//! Samples of a split run concurrently up to `max_concurrency`, each under
//! `sample_timeout_ms`. Failures that belong to one sample (model calls,
//! parsing, retrieval, timeouts) are recorded as zero-score results; other
//! errors abort the call.

mod checkpoint;
mod report;

pub use checkpoint::CheckpointWriter;
pub use report::{EvalReport, Proposal, SampleResult, StepRecord, TrainReport};

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::adal::{AdalComponent, Sample};
use crate::component::{GradComponent, Mode, Run};
use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::graph::{value_text, BackwardEngine, Feedback, Graph, SharedParameter};
use crate::optim::{DemoOptimizer, Optimizer, TextOptimizer};

/// Run-level cancellation signal. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Feedback one training sample left on pipeline-owned parameters.
struct TrainedSample {
    result: SampleResult,
    feedback: HashMap<String, Vec<Feedback>>,
}

/// Drives [`AdalComponent`]s over dataset splits.
pub struct Trainer<A: AdalComponent> {
    adal: A,
    config: TrainerConfig,
    cancel: CancelToken,
}

impl<A: AdalComponent> Trainer<A> {
    pub fn new(adal: A, config: TrainerConfig) -> Self {
        Self {
            adal,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn adal(&self) -> &A {
        &self.adal
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Score `dataset` in inference mode without changing any parameter.
    #[instrument(skip(self, dataset), fields(samples = dataset.len()))]
    pub async fn diagnose(&self, dataset: &[A::Sample], split: &str) -> Result<EvalReport> {
        self.config.validate()?;
        self.adal.check_config(Mode::Inference).await?;
        let report = self.evaluate(dataset, split).await?;
        info!(
            split,
            mean_score = report.mean_score,
            failures = report.failure_count,
            "diagnose finished"
        );
        Ok(report)
    }

    /// Optimize the pipeline's parameters on `train`, selecting on `val`.
    #[instrument(skip_all, fields(train = train.len(), val = val.len()))]
    pub async fn fit(&self, train: &[A::Sample], val: &[A::Sample]) -> Result<TrainReport> {
        self.config.validate()?;
        self.adal.check_config(Mode::Training).await?;
        let roles = self.adal.roles();
        let engine = roles
            .backward_engine
            .clone()
            .map(|model| BackwardEngine::new(model).with_retry(roles.retry.clone()))
            .ok_or_else(|| Error::Config("training requires a backward engine model".to_string()))?;

        let mut optimizers: Vec<Box<dyn Optimizer>> =
            vec![Box::new(DemoOptimizer::new(self.config.max_demos))];
        match roles.text_optimizer.clone() {
            Some(model) => {
                optimizers.push(Box::new(TextOptimizer::new(model).with_retry(roles.retry.clone())))
            }
            None => info!("no text optimizer model configured, prompts stay fixed"),
        }
        let checkpoints = match self.config.checkpoint_path()? {
            Some(dir) => Some(CheckpointWriter::new(dir)?),
            None => None,
        };

        let started_at = Utc::now();
        let initial = self.evaluate(val, "val").await?;
        let mut best = initial.mean_score;
        info!(score = best, "initial validation");

        let mut steps = Vec::new();
        if !train.is_empty() {
            for step in 0..self.config.max_steps {
                if self.cancel.is_cancelled() {
                    break;
                }
                let batch = self.batch(train, step);
                let record = self.step(step, &batch, val, &engine, &optimizers, &mut best).await?;
                if let Some(writer) = &checkpoints {
                    writer.write_step(&record)?;
                }
                steps.push(record);
            }
        }

        let mut parameters = BTreeMap::new();
        for shared in self.adal.task().parameters() {
            let param = shared.read().await;
            if param.requires_opt {
                parameters.insert(param.name.clone(), param.data().clone());
            }
        }

        let report = TrainReport {
            initial_val_score: initial.mean_score,
            best_val_score: best,
            steps,
            parameters,
            cancelled: self.cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
        };
        if let Some(writer) = &checkpoints {
            writer.write_report(&report)?;
        }
        info!(
            initial = report.initial_val_score,
            best = report.best_val_score,
            steps = report.steps.len(),
            "fit finished"
        );
        Ok(report)
    }

    fn batch(&self, train: &[A::Sample], step: usize) -> Vec<A::Sample> {
        let size = self.config.batch_size.min(train.len());
        let start = (step * self.config.batch_size) % train.len();
        (0..size)
            .map(|k| train[(start + k) % train.len()].clone())
            .collect()
    }

    async fn step(
        &self,
        step: usize,
        batch: &[A::Sample],
        val: &[A::Sample],
        engine: &BackwardEngine,
        optimizers: &[Box<dyn Optimizer>],
        best: &mut f64,
    ) -> Result<StepRecord> {
        let task = self.adal.task();
        task.set_teacher(self.adal.roles().teacher.clone()).await;
        let trained = self
            .run_split(batch, |index, sample| self.train_sample(index, sample, engine))
            .await;
        task.set_teacher(None).await;
        let (trained, cancelled) = trained?;

        // Single-owner merge, in sample order.
        let mut merged: HashMap<String, Vec<Feedback>> = HashMap::new();
        let mut results = Vec::with_capacity(trained.len());
        for sample in trained {
            for (name, feedback) in sample.feedback {
                merged.entry(name).or_default().extend(feedback);
            }
            results.push(sample.result);
        }
        let batch_report = EvalReport::from_results("train", results, cancelled);
        debug!(step, score = batch_report.mean_score, "batch scored");

        let shared = task.parameters();
        let proposals = self.propose(&shared, &merged, optimizers).await?;
        if proposals.is_empty() || self.cancel.is_cancelled() {
            return Ok(StepRecord {
                step,
                batch: batch_report,
                proposals: Vec::new(),
                val_score: None,
                accepted: false,
            });
        }

        for (slot, proposal) in &proposals {
            shared[*slot].write().await.update(proposal.proposed.clone())?;
        }
        let val_report = self.evaluate(val, "val").await?;
        let accepted = val_report.mean_score > *best && !val_report.cancelled;
        if accepted {
            info!(step, score = val_report.mean_score, "proposals accepted");
            *best = val_report.mean_score;
        } else {
            info!(step, score = val_report.mean_score, best = *best, "proposals reverted");
            for (slot, proposal) in &proposals {
                shared[*slot].write().await.update(proposal.previous.clone())?;
            }
        }

        Ok(StepRecord {
            step,
            batch: batch_report,
            proposals: proposals.into_iter().map(|(_, p)| p).collect(),
            val_score: Some(val_report.mean_score),
            accepted,
        })
    }

    /// One proposal per parameter, from the first optimizer that accepts it
    /// and has something to propose.
    async fn propose(
        &self,
        shared: &[SharedParameter],
        merged: &HashMap<String, Vec<Feedback>>,
        optimizers: &[Box<dyn Optimizer>],
    ) -> Result<Vec<(usize, Proposal)>> {
        let mut proposals = Vec::new();
        for (slot, param) in shared.iter().enumerate() {
            let param = param.read().await;
            let Some(feedback) = merged.get(&param.name) else {
                continue;
            };
            for optimizer in optimizers.iter().filter(|o| o.accepts(&param)) {
                match optimizer.propose(&param, feedback).await {
                    Ok(Some(proposed)) => {
                        proposals.push((
                            slot,
                            Proposal {
                                param: param.name.clone(),
                                optimizer: optimizer.name().to_string(),
                                previous: param.data().clone(),
                                proposed,
                            },
                        ));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_sample_level() => {
                        warn!(param = %param.name, optimizer = optimizer.name(), "proposal failed: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(proposals)
    }

    async fn evaluate(&self, dataset: &[A::Sample], split: &str) -> Result<EvalReport> {
        let (results, cancelled) = self
            .run_split(dataset, |index, sample| self.eval_sample(index, sample))
            .await?;
        Ok(EvalReport::from_results(split, results, cancelled))
    }

    /// Run `work` over every sample with bounded concurrency and a per-sample
    /// timeout. Returns the finished samples and whether cancellation skipped
    /// any.
    async fn run_split<'a, T, F, Fut>(
        &'a self,
        dataset: &'a [A::Sample],
        work: F,
    ) -> Result<(Vec<T>, bool)>
    where
        T: FromFailure,
        F: Fn(usize, &'a A::Sample) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let limit = Duration::from_millis(self.config.sample_timeout_ms);

        let tasks: Vec<_> = dataset
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let semaphore = Arc::clone(&semaphore);
                let fut = work(index, sample);
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| Error::Internal("sample semaphore closed".to_string()))?;
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let ground_truth = self.adal.ground_truth(sample);
                    match tokio::time::timeout(limit, fut).await {
                        Ok(Ok(done)) => Ok(Some(done)),
                        Ok(Err(e)) if e.is_sample_level() => {
                            warn!(sample_id = %sample.id(), "sample failed: {}", e);
                            Ok(Some(T::from_failure(SampleResult::failure(
                                index,
                                sample.id(),
                                ground_truth,
                                e.to_string(),
                            ))))
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => {
                            let e = Error::timeout(self.config.sample_timeout_ms);
                            warn!(sample_id = %sample.id(), "sample failed: {}", e);
                            Ok(Some(T::from_failure(SampleResult::failure(
                                index,
                                sample.id(),
                                ground_truth,
                                e.to_string(),
                            ))))
                        }
                    }
                }
            })
            .collect();

        let mut done = Vec::with_capacity(dataset.len());
        for outcome in join_all(tasks).await {
            if let Some(item) = outcome? {
                done.push(item);
            }
        }
        let cancelled = done.len() < dataset.len();
        Ok((done, cancelled))
    }

    async fn eval_sample(&self, index: usize, sample: &A::Sample) -> Result<SampleResult> {
        let mut run = Run::inference();
        let output = self
            .adal
            .prepare_task(sample, Mode::Inference)
            .invoke(self.adal.task(), &mut run)
            .await?
            .into_value();
        let eval = self.adal.prepare_eval(sample, output.as_ref());
        let error = output.and_then(|o| o.error);
        Ok(SampleResult {
            index,
            id: sample.id().to_string(),
            score: scored(&error, || eval.score()),
            predicted: eval.y,
            ground_truth: eval.y_gt,
            error,
        })
    }

    async fn train_sample(
        &self,
        index: usize,
        sample: &A::Sample,
        engine: &BackwardEngine,
    ) -> Result<TrainedSample> {
        let (result, graph) = self.backward_sample(index, sample, engine).await?;
        Ok(TrainedSample {
            result,
            feedback: graph.attached_feedback(),
        })
    }

    /// Forward, loss and backward pass of one sample, on its own graph.
    async fn backward_sample(
        &self,
        index: usize,
        sample: &A::Sample,
        engine: &BackwardEngine,
    ) -> Result<(SampleResult, Graph)> {
        let mut run = Run::training();
        let pred = self
            .adal
            .prepare_task(sample, Mode::Training)
            .invoke(self.adal.task(), &mut run)
            .await?
            .param()
            .ok_or_else(|| Error::Internal("training run returned a concrete value".to_string()))?;
        let mut graph = run.into_graph();

        let loss_call = self.adal.prepare_loss(sample, &mut graph, pred)?;
        let loss = loss_call.forward(&mut graph)?;
        let loss_score = graph.get(loss)?.data().as_f64().unwrap_or(0.0);
        graph.backward(loss, engine).await?;

        let pred_node = graph.get(pred)?;
        let error = pred_node.full_response().and_then(|r| r.error.clone());
        let result = SampleResult {
            index,
            id: sample.id().to_string(),
            score: scored(&error, || loss_score),
            predicted: value_text(pred_node.eval_input()),
            ground_truth: value_text(graph.get(loss_call.y_gt)?.data()),
            error,
        };
        Ok((result, graph))
    }
}

/// A prediction that failed to generate scores the lowest possible score,
/// whatever the eval fn would make of the empty answer.
fn scored(error: &Option<String>, score: impl FnOnce() -> f64) -> f64 {
    match error {
        Some(_) => 0.0,
        None => score(),
    }
}

/// Outcomes the split runner can synthesize for a failed sample.
trait FromFailure {
    fn from_failure(result: SampleResult) -> Self;
}

impl FromFailure for SampleResult {
    fn from_failure(result: SampleResult) -> Self {
        result
    }
}

impl FromFailure for TrainedSample {
    fn from_failure(result: SampleResult) -> Self {
        Self {
            result,
            feedback: HashMap::new(),
        }
    }
}
