// Run orchestration.
//
// RunConfig -> model, run log, trajectory store, data stream -> trainer for
// the configured mode. Also the entry point for re-scoring a saved
// trajectory.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::budget::SegmentKind;
use crate::config::{RunConfig, TrainingMode, TrajectoryFormat};
use crate::dataset::{build_datapoint_pairs, build_documents};
use crate::error::RaoError;
use crate::evaluate::{ActionEvaluator, EvaluationResults};
use crate::external::{message_loss_delta, CompletionProvider, HelpfulMessenger, LossDelta};
use crate::logging::{JsonlMetrics, MetricsSink, NullMetrics, RunLog};
use crate::model::CausalLm;
use crate::rao::train_rao;
use crate::tokenizer::TextTokenizer;
use crate::trainer::{train, TrainContext};
use crate::trajectory::{
    read_trajectory, JsonTrajectoryFile, SqliteTrajectoryLog, TrajectoryMetadata, TrajectoryStore,
};
use crate::transformer::RaoTransformer;

pub struct RunSummary {
    pub run_name: String,
    /// Aggregate loss of every scored batch, in order.
    pub losses: Vec<f32>,
    pub trajectory: Option<PathBuf>,
}

/// Fresh model, or the checkpoint in `load_from` when set.
pub fn build_model(run: &RunConfig) -> Result<RaoTransformer> {
    let model = RaoTransformer::new(run.init.model.transformer.clone(), &run.device)?;
    if let Some(dir) = &run.init.model.load_from {
        model.load(dir)?;
        tracing::info!("[RUN] Loaded weights from {}", dir.display());
    }
    Ok(model)
}

pub fn trajectory_metadata(run: &RunConfig) -> Result<TrajectoryMetadata> {
    let init = &run.init;
    let prediction = match run.plan.get(SegmentKind::Action) {
        Some(_) => "action_and_observation",
        None => "observation",
    };
    Ok(TrajectoryMetadata {
        model: init.model.name.clone(),
        lr: init.training.lr,
        batch_size: init.batch_size,
        num_batches: init.num_batches,
        optimizer: init.training.optimizer.name().to_string(),
        dataset: serde_json::to_value(&init.dataset)?,
        perturbation: serde_json::to_value(&init.perturbation)?,
        trainer: init.mode.name().to_string(),
        inference: serde_json::to_value(&init.sampling)?,
        prediction: prediction.to_string(),
    })
}

/// Primary rank only.
pub fn open_trajectory(run: &RunConfig) -> Result<Option<Box<dyn TrajectoryStore>>> {
    if !run.is_primary() {
        return Ok(None);
    }
    let metadata = trajectory_metadata(run)?;
    let dir = &run.init.save_dir;
    let base = &run.paths.trajectory_base;
    let store: Box<dyn TrajectoryStore> = match run.init.trajectory_format {
        TrajectoryFormat::Json => Box::new(JsonTrajectoryFile::create(dir, base, metadata)?),
        TrajectoryFormat::Sqlite => {
            std::fs::create_dir_all(dir)?;
            Box::new(SqliteTrajectoryLog::open(&dir.join(format!("{base}.sqlite")), &metadata)?)
        }
    };
    Ok(Some(store))
}

pub fn open_log(run: &RunConfig) -> Result<RunLog> {
    let metrics: Box<dyn MetricsSink> = if run.is_primary() {
        Box::new(JsonlMetrics::create(&run.paths.metrics)?)
    } else {
        Box::new(NullMetrics)
    };
    RunLog::open(run.is_primary(), &run.paths.log, metrics)
}

/// Train the model described by `run` to completion.
pub fn run_training(run: &RunConfig, tokenizer: Rc<dyn TextTokenizer>) -> Result<RunSummary> {
    let model = build_model(run)?;
    let mut log = open_log(run)?;
    let budget = run.budget();
    log.line(&format!("Run: {}", run.run_name))?;
    log.line(&format!(
        "Widths (loss/action/observation): {}/{}/{} of {}",
        budget.tok_p_loss, budget.tok_p_action, budget.tok_p_obs, run.ctx
    ))?;

    let store = open_trajectory(run)?;
    let trajectory = store.as_ref().map(|s| s.location().to_path_buf());
    let mut ctx = TrainContext::new(run, &model, &*tokenizer, log, store)?;
    let losses = match &run.init.mode {
        TrainingMode::Rao { obs_between_weight_updates, .. } => {
            let documents = build_documents(run, tokenizer.clone(), *obs_between_weight_updates)?;
            train_rao(&mut ctx, documents)?
        }
        TrainingMode::ObservationOnly | TrainingMode::ActionObservation => {
            train(&mut ctx, build_datapoint_pairs(run, tokenizer.clone())?)?
        }
    };
    if let Some(path) = &trajectory {
        tracing::info!("[RUN] Trajectory written to {}", path.display());
    }
    Ok(RunSummary { run_name: run.run_name.clone(), losses, trajectory })
}

/// Re-score the actions of a saved trajectory with `model`.
pub fn evaluate_trajectory(
    model: &dyn CausalLm,
    tokenizer: &dyn TextTokenizer,
    path: &Path,
    n_max: Option<usize>,
    n_step: usize,
    device: &Device,
) -> Result<EvaluationResults> {
    let doc = read_trajectory(path)?;
    let mut rng = rand::thread_rng();
    ActionEvaluator::new(model, tokenizer)
        .with_limits(n_max, n_step)
        .evaluate(&doc, device, &mut rng)
}

/// Ask `provider` for a `width`-token message per observation in a saved
/// trajectory and measure how much it lowers the model's loss on that
/// observation. Returns (batch_index, delta) per scored step.
pub fn score_helpful_messages(
    model: &dyn CausalLm,
    tokenizer: &dyn TextTokenizer,
    provider: &dyn CompletionProvider,
    path: &Path,
    width: usize,
    n_max: Option<usize>,
    device: &Device,
) -> Result<Vec<(usize, LossDelta)>> {
    let doc = read_trajectory(path)?;
    let messenger = HelpfulMessenger::new(provider, tokenizer, width);
    let mut scores = Vec::new();
    for step in doc.trajectory.iter().take(n_max.unwrap_or(usize::MAX)) {
        let ids = tokenizer.encode(&step.obs)?;
        if ids.len() < 2 {
            continue;
        }
        let requested = width + ids.len();
        if requested > model.max_positions() {
            return Err(RaoError::LengthExceeded { requested, max: model.max_positions() }.into());
        }
        let content = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
        let message = messenger.message_for(&content)?;
        let delta = message_loss_delta(model, &content, &message)?;
        tracing::info!(
            "[HELPFUL] batch {}: {:.4} -> {:.4}",
            step.batch_index,
            delta.without_message,
            delta.with_message
        );
        scores.push((step.batch_index, delta));
    }
    Ok(scores)
}
