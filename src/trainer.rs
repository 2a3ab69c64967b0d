// Single-step trainer.
//
// For each (previous, current) datapoint pair: pick an action (ground truth,
// or sampled with the adapter on, with an adapter-off sample as baseline),
// score it, update weights, optionally re-score a perturbed copy, then append
// the trajectory record, checkpoint and log. State is threaded explicitly
// through `step`.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use crate::assemble::{encode_segment, repeat_interleave};
use crate::budget::{SegmentKind, SegmentPlan};
use crate::config::{DebugMode, RunConfig, TrainingMode};
use crate::dataset::{Datapoint, PairStream};
use crate::logging::RunLog;
use crate::loss::{aggregate_objective, neg_log_probs, predict_action, predict_observation, ObjectiveInputs};
use crate::model::CausalLm;
use crate::perturb::ActionPerturber;
use crate::sampler::ActionSampler;
use crate::tokenizer::TextTokenizer;
use crate::training::WeightUpdater;
use crate::trajectory::{TrajectoryStep, TrajectoryStore};

/// Action used at the start of every trajectory and as the baseline for
/// ground-truth actions.
pub const DEFAULT_ACTION_TEXT: &str = "I will restate and work through the following question step by step, decomposing problems into subproblems as needed.";

#[derive(Clone, Debug)]
pub struct TrainerState {
    /// (batch, tok_p_action)
    pub prev_action: Tensor,
    pub batch_index: usize,
    pub aggregate_loss: Option<f32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepLosses {
    pub action_loss: f32,
    pub observation_loss: f32,
    pub value_loss: Option<f32>,
    pub negentropy: Option<f32>,
    pub perturbed_loss: Option<f32>,
}

/// The canned default action, (batch, tok_p_action). Zero-width when the
/// mode has no actions.
pub fn default_action(
    tokenizer: &dyn TextTokenizer,
    plan: &SegmentPlan,
    device: &candle_core::Device,
) -> Result<Tensor> {
    if plan.get(SegmentKind::Action).is_none() {
        return Ok(Tensor::zeros((plan.batch_size, 0), DType::U32, device)?);
    }
    let texts = vec![DEFAULT_ACTION_TEXT.to_string(); plan.batch_size];
    encode_segment(&texts, SegmentKind::Action, tokenizer, plan, device)
}

pub struct TrainContext<'a> {
    pub run: &'a RunConfig,
    pub model: &'a dyn CausalLm,
    pub tokenizer: &'a dyn TextTokenizer,
    pub log: RunLog,
    pub(crate) sampler: Option<ActionSampler>,
    pub(crate) updater: Option<WeightUpdater>,
    pub(crate) trajectory: Option<Box<dyn TrajectoryStore>>,
    default_action: Tensor,
}

impl<'a> TrainContext<'a> {
    pub fn new(
        run: &'a RunConfig,
        model: &'a dyn CausalLm,
        tokenizer: &'a dyn TextTokenizer,
        log: RunLog,
        trajectory: Option<Box<dyn TrajectoryStore>>,
    ) -> Result<Self> {
        let sampler = match run.plan.get(SegmentKind::Action) {
            Some(_) => Some(ActionSampler::new(&run.plan, run.init.sampling.clone(), tokenizer)?),
            None => None,
        };
        let updater = match run.init.debug {
            Some(DebugMode::NoWeightUpdates) => None,
            _ => Some(WeightUpdater::new(
                model.trainable_vars(run.init.train_scope),
                &run.init.training,
            )?),
        };
        let default_action = default_action(tokenizer, &run.plan, &run.device)?;
        Ok(Self { run, model, tokenizer, log, sampler, updater, trajectory, default_action })
    }

    pub fn initial_state(&self) -> TrainerState {
        TrainerState { prev_action: self.default_action.clone(), batch_index: 0, aggregate_loss: None }
    }

    pub fn updater(&self) -> Option<&WeightUpdater> {
        self.updater.as_ref()
    }

    pub fn trajectory(&self) -> Option<&dyn TrajectoryStore> {
        self.trajectory.as_deref()
    }

    pub(crate) fn save_checkpoint(&self, batch_index: usize) -> Result<()> {
        let run = self.run;
        if batch_index > 0 && batch_index % run.init.interval_save_weights == 0 && run.is_primary() {
            tracing::info!("[CHECKPOINT] Saving {} at batch {batch_index}", run.init.model.name);
            self.model.save(&run.paths.weights)?;
            self.tokenizer.save(&run.paths.tokenizer)?;
        }
        Ok(())
    }

    fn num_return_sequences(&self) -> usize {
        self.run.init.sampling.num_return_sequences.max(1)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

struct Scored {
    action: Tensor,
    /// Per-row observation loss when candidates were scored, (rows).
    row_obs_loss: Option<Tensor>,
    aggregate: Tensor,
    losses: StepLosses,
    extra: Vec<(&'static str, f64)>,
}

/// Advance the trainer by one datapoint pair.
pub fn step(state: TrainerState, pair: &(Datapoint, Datapoint), ctx: &mut TrainContext<'_>) -> Result<TrainerState> {
    let (prev, datapoint) = pair;
    let batch_index = state.batch_index;

    if datapoint.first {
        ctx.log.line(&format!("First (batch {batch_index}): new trajectory, action reset"))?;
        return Ok(TrainerState {
            prev_action: ctx.default_action.clone(),
            batch_index: batch_index + 1,
            aggregate_loss: None,
        });
    }

    let prev_obs = &prev.observation;
    let obs = &datapoint.observation;
    let mut scored = match ctx.run.init.mode {
        TrainingMode::ObservationOnly => score_observation_only(ctx, &state.prev_action, prev_obs, obs)?,
        TrainingMode::ActionObservation => {
            let (action, baseline) = choose_action(ctx, &state.prev_action, prev_obs, datapoint)?;
            score_action_observation(ctx, &state.prev_action, prev_obs, action, &baseline, obs)?
        }
        TrainingMode::Rao { .. } => bail!("rao mode is trained window by window, not step by step"),
    };

    if let Some(updater) = ctx.updater.as_mut() {
        updater.backward_step(&scored.aggregate)?;
    }
    let aggregate_loss = scored.aggregate.to_dtype(DType::F32)?.to_scalar::<f32>()?;

    if let Some(p) = &ctx.run.init.perturbation {
        let has_actions = ctx.run.plan.get(SegmentKind::Action).is_some();
        if has_actions && batch_index % p.eval_every == 0 {
            let offset = ctx.run.plan.prefix(SegmentKind::Action)?.len();
            let perturbed = ActionPerturber::new(ctx.tokenizer, offset).perturb(
                &scored.action,
                p,
                &mut rand::thread_rng(),
            )?;
            let obs = repeat_interleave(obs, ctx.num_return_sequences())?;
            let loss = predict_observation(ctx.model, &perturbed, &obs, false)?.mean_all()?;
            scored.losses.perturbed_loss = Some(loss.to_scalar::<f32>()?);
        }
    }

    let next_action = best_of_groups(&scored.action, scored.row_obs_loss.as_ref(), ctx.num_return_sequences())?;
    log_and_save(
        ctx,
        StepRecord {
            batch_index,
            prev_action: &state.prev_action,
            prev_obs,
            action: &next_action,
            obs,
            is_guidance: datapoint.action.is_some(),
            aggregate_loss,
            losses: scored.losses,
            extra: &scored.extra,
        },
    )?;

    Ok(TrainerState { prev_action: next_action, batch_index: batch_index + 1, aggregate_loss: Some(aggregate_loss) })
}

/// Run the trainer over the whole stream. Returns the aggregate loss of every
/// scored step.
pub fn train(ctx: &mut TrainContext<'_>, pairs: PairStream) -> Result<Vec<f32>> {
    let mut state = ctx.initial_state();
    let mut history = Vec::new();
    for pair in pairs {
        state = step(state, &pair?, ctx)?;
        history.extend(state.aggregate_loss);
    }
    tracing::info!("[TRAIN] finished after {} batches, {} scored", state.batch_index, history.len());
    Ok(history)
}

/// (action, baseline), both (batch * num_return_sequences, tok_p_action).
fn choose_action(
    ctx: &TrainContext<'_>,
    prev_action: &Tensor,
    prev_obs: &Tensor,
    datapoint: &Datapoint,
) -> Result<(Tensor, Tensor)> {
    let n = ctx.num_return_sequences();
    if let Some(truth) = &datapoint.action {
        return Ok((repeat_interleave(truth, n)?, repeat_interleave(&ctx.default_action, n)?));
    }
    let Some(sampler) = ctx.sampler.as_ref() else {
        bail!("no action sampler in a mode without actions");
    };
    let action = sampler.sample(ctx.model, prev_action, prev_obs, true)?;
    let baseline = sampler.sample(ctx.model, prev_action, prev_obs, false)?;
    Ok((action, baseline))
}

fn score_observation_only(
    ctx: &TrainContext<'_>,
    prev_action: &Tensor,
    prev_obs: &Tensor,
    obs: &Tensor,
) -> Result<Scored> {
    let pure = ctx.run.plan.pure_width(SegmentKind::Observation);
    let seq = Tensor::cat(&[prev_obs, obs], 1)?;
    let nll = neg_log_probs(ctx.model, &seq, true)?;
    let aggregate = nll.narrow(1, nll.dim(1)? - pure, pure)?.mean_all()?;
    let observation_loss = aggregate.to_scalar::<f32>()?;
    Ok(Scored {
        action: prev_action.clone(),
        row_obs_loss: None,
        aggregate,
        losses: StepLosses { observation_loss, ..Default::default() },
        extra: Vec::new(),
    })
}

fn score_action_observation(
    ctx: &TrainContext<'_>,
    prev_action: &Tensor,
    prev_obs: &Tensor,
    action: Tensor,
    baseline: &Tensor,
    obs: &Tensor,
) -> Result<Scored> {
    let n = ctx.num_return_sequences();
    let prev_action = repeat_interleave(prev_action, n)?;
    let prev_obs = repeat_interleave(prev_obs, n)?;
    let obs = repeat_interleave(obs, n)?;
    let model = ctx.model;

    let current = predict_action(model, &prev_action, &prev_obs, &action, true)?;
    let reference = predict_action(model, &prev_action, &prev_obs, &action, false)?;
    let obs_loss = predict_observation(model, &action, &obs, false)?;
    let default_obs_loss = predict_observation(model, baseline, &obs, false)?;
    let old_action_loss = reference.loss.detach();

    let objective = aggregate_objective(&ObjectiveInputs {
        obs_loss: &obs_loss,
        default_obs_loss: &default_obs_loss,
        values: &current.values,
        action_loss: &current.loss,
        old_action_loss: &old_action_loss,
        negentropy: &current.negentropy,
    })?;

    let scalar = |t: &Tensor| -> Result<f32> { Ok(t.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?) };
    let losses = StepLosses {
        action_loss: scalar(&current.loss)?,
        observation_loss: scalar(&obs_loss)?,
        value_loss: Some(scalar(&objective.value_loss)?),
        negentropy: Some(scalar(&current.negentropy)?),
        perturbed_loss: None,
    };
    let extra = vec![
        ("Values", scalar(&current.values)? as f64),
        ("Normalized Obs Loss", scalar(&objective.normalized_obs)? as f64),
        ("Old Critic Action Loss", scalar(&old_action_loss)? as f64),
        ("Action Prob Ratio", scalar(&objective.ratio)? as f64),
    ];
    Ok(Scored { action, row_obs_loss: Some(obs_loss.detach()), aggregate: objective.aggregate, losses, extra })
}

/// One action per batch slot for the next step: within each group of `n`
/// candidates the one with the lowest observation loss, or the first when no
/// losses are known.
fn best_of_groups(rows: &Tensor, obs_loss: Option<&Tensor>, n: usize) -> Result<Tensor> {
    if n <= 1 {
        return Ok(rows.clone());
    }
    let groups = rows.dim(0)? / n;
    let losses = match obs_loss {
        Some(l) => Some(l.to_dtype(DType::F32)?.to_vec1::<f32>()?),
        None => None,
    };
    let idx: Vec<u32> = (0..groups)
        .map(|g| {
            let start = g * n;
            let best = match &losses {
                Some(l) => (start..start + n)
                    .min_by(|&a, &b| l[a].total_cmp(&l[b]))
                    .unwrap_or(start),
                None => start,
            };
            best as u32
        })
        .collect();
    Ok(rows.index_select(&Tensor::new(idx.as_slice(), rows.device())?, 0)?)
}

// ---------------------------------------------------------------------------
// Logging and persistence
// ---------------------------------------------------------------------------

struct StepRecord<'t> {
    batch_index: usize,
    prev_action: &'t Tensor,
    prev_obs: &'t Tensor,
    action: &'t Tensor,
    obs: &'t Tensor,
    is_guidance: bool,
    aggregate_loss: f32,
    losses: StepLosses,
    extra: &'t [(&'static str, f64)],
}

pub(crate) fn decode_first_row(tokenizer: &dyn TextTokenizer, t: &Tensor) -> Result<String> {
    tokenizer.decode(&t.get(0)?.to_vec1::<u32>()?)
}

fn fmt_opt(v: Option<f32>) -> String {
    match v {
        Some(v) => format!("{v:.4}"),
        None => "None".to_string(),
    }
}

fn log_and_save(ctx: &mut TrainContext<'_>, rec: StepRecord<'_>) -> Result<()> {
    let tok = ctx.tokenizer;
    let run = ctx.run;
    let StepRecord { batch_index, losses, aggregate_loss, .. } = rec;

    let prev_obs_text = decode_first_row(tok, rec.prev_obs)?;
    let action_text = decode_first_row(tok, rec.action)?;
    let obs_text = decode_first_row(tok, rec.obs)?;

    if let Some(store) = ctx.trajectory.as_mut() {
        store.append(TrajectoryStep {
            batch_index,
            prev_obs: prev_obs_text.clone(),
            action: action_text.clone(),
            obs: obs_text.clone(),
            observation_loss: losses.observation_loss,
            value_loss: losses.value_loss.unwrap_or(0.0),
            negentropy: losses.negentropy.unwrap_or(0.0),
            perturbed_loss: losses.perturbed_loss,
        })?;
    }

    ctx.save_checkpoint(batch_index)?;

    let mut scalars: Vec<(&str, f64)> = vec![
        ("Batch Index", batch_index as f64),
        ("Aggregate Loss", aggregate_loss as f64),
        ("Observation Loss", losses.observation_loss as f64),
    ];
    if run.init.mode != TrainingMode::ObservationOnly {
        scalars.push(("Action Loss", losses.action_loss as f64));
        scalars.extend(losses.value_loss.map(|v| ("Value Loss", v as f64)));
        scalars.extend(losses.negentropy.map(|v| ("Negentropy", v as f64)));
        scalars.extend(losses.perturbed_loss.map(|v| ("Perturbed Loss", v as f64)));
    }
    scalars.extend_from_slice(rec.extra);
    ctx.log.scalars(batch_index, &scalars)?;

    if batch_index % run.init.interval_print == 0 {
        let log = &mut ctx.log;
        if run.init.mode == TrainingMode::ObservationOnly {
            log.line(&format!("Obs loss: {:.4}", losses.observation_loss))?;
        } else {
            log.line(&format!("Aggregate loss: {aggregate_loss}"))?;
            log.line(&format!(
                "Action/Obs/Q/NegEnt/Pert loss: {:.4}/{:.4}/{}/{}/{}",
                losses.action_loss,
                losses.observation_loss,
                fmt_opt(losses.value_loss),
                fmt_opt(losses.negentropy),
                fmt_opt(losses.perturbed_loss),
            ))?;
        }
        log.line(&format!("Batch Index: {batch_index}"))?;
        log.line(&format!("Aggregate Loss: {aggregate_loss}"))?;
        log.line(&format!("Training mode: {}", run.init.mode.name()))?;
        log.line("Is First: false")?;
        log.line(&format!("Prev Action: {:?}", decode_first_row(tok, rec.prev_action)?))?;
        log.line(&format!("Prev Observation: {prev_obs_text:?}"))?;
        let label = if rec.is_guidance { "Guidance Action" } else { "Action" };
        log.line(&format!("{label}: {action_text:?}"))?;
        log.line(&format!("Observation: {obs_text:?}"))?;
    }
    ctx.log.separator()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
