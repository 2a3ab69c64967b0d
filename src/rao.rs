// Loss-bearing RAO training: many (Loss, Action, Observation) triples per
// context window.
//
// For a document of observations the triples are built one at a time. The
// loss segment of triple i renders the observation loss of triple i-1 (or its
// change when loss differences are on), the action is sampled from the recent
// triples, and the observation comes from the document. The finished sequence
// is scored window by window, every window led by one eos anchor column so
// the shifted losses line up with the triple tokens, and the mean is trained.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Tensor};

use crate::assemble::{assemble_triples, render_loss_segment, window_chunks, Triple};
use crate::budget::{SegmentKind, TokenBudget};
use crate::config::TrainingMode;
use crate::dataset::DocumentStream;
use crate::loss::{neg_log_probs, split_rao, SegmentMeans};
use crate::trainer::{decode_first_row, TrainContext};
use crate::trajectory::TrajectoryStep;

pub struct RaoOutcome {
    pub aggregate_loss: f32,
    pub means: SegmentMeans,
    /// Means scaled by each kind's share of tok_p_rao.
    pub weighted: SegmentMeans,
    /// Batch-mean observation loss of each triple while it was built.
    pub observation_losses: Vec<f32>,
    /// (batch, n_triples * tok_p_rao)
    pub sequence: Tensor,
}

/// Column range of `kind` inside triple `index` of an assembled sequence.
pub fn segment_of(seq: &Tensor, budget: &TokenBudget, index: usize, kind: SegmentKind) -> Result<Tensor> {
    let offset = match kind {
        SegmentKind::Loss => 0,
        SegmentKind::Action => budget.tok_p_loss,
        SegmentKind::Observation => budget.tok_p_loss + budget.tok_p_action,
    };
    let start = index * budget.tok_p_rao() + offset;
    Ok(seq.narrow(1, start, budget.width(kind))?)
}

fn weighted(means: &SegmentMeans, budget: &TokenBudget) -> SegmentMeans {
    let total = budget.tok_p_rao() as f32;
    SegmentMeans {
        loss: means.loss.map(|l| l * budget.tok_p_loss as f32 / total),
        action: means.action.map(|a| a * budget.tok_p_action as f32 / total),
        observation: means.observation * budget.tok_p_obs as f32 / total,
    }
}

/// Build, score and train on one document of shape (batch, n_obs, tok_p_obs).
pub fn rao_step(ctx: &mut TrainContext<'_>, document: &Tensor) -> Result<RaoOutcome> {
    let run = ctx.run;
    let TrainingMode::Rao { num_rao, use_loss_difference, .. } = run.init.mode else {
        bail!("rao_step needs the rao training mode");
    };
    let plan = &run.plan;
    let budget = plan.budget;
    let (batch, n_obs, obs_width) = document.dims3()?;
    ensure!(
        obs_width == budget.tok_p_obs,
        "document observations are {obs_width} wide, expected {}",
        budget.tok_p_obs
    );
    let sampler = ctx.sampler.as_ref().context("rao mode needs an action sampler")?;
    let device = document.device();
    let model = ctx.model;
    let anchor = Tensor::full(ctx.tokenizer.eos_id(), (batch, 1), device)?;

    let mut triples: Vec<Tensor> = Vec::with_capacity(n_obs);
    let mut signal = vec![0f32; batch];
    let mut prev_losses: Option<Vec<f32>> = None;
    let mut observation_losses = Vec::with_capacity(n_obs);

    for i in 0..n_obs {
        let loss_segment = render_loss_segment(&signal, ctx.tokenizer, plan, device)?;
        let recent = &triples[triples.len().saturating_sub(num_rao)..];
        let mut context: Vec<&Tensor> = vec![&anchor];
        context.extend(recent);
        context.push(&loss_segment);
        let action = sampler.continue_context(model, &Tensor::cat(&context, 1)?, true)?;
        let observation = document.narrow(1, i, 1)?.squeeze(1)?.contiguous()?;
        triples.push(assemble_triples(
            &[Triple { loss: Some(loss_segment), action, observation }],
            &budget,
        )?);

        // Loss of the new observation given the recent window. Not trained.
        let mut window: Vec<&Tensor> = vec![&anchor];
        window.extend(&triples[triples.len().saturating_sub(num_rao)..]);
        let nll = neg_log_probs(model, &Tensor::cat(&window, 1)?, true)?.detach();
        let obs_nll = split_rao(&nll, &budget)?.observation;
        let cols = obs_nll.dim(1)?;
        let row_losses = obs_nll
            .narrow(1, cols - budget.tok_p_obs, budget.tok_p_obs)?
            .mean(1)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        observation_losses.push(row_losses.iter().sum::<f32>() / batch as f32);

        signal = match (&prev_losses, use_loss_difference) {
            (_, false) => row_losses.clone(),
            (Some(prev), true) => row_losses.iter().zip(prev).map(|(now, before)| now - before).collect(),
            (None, true) => vec![0.0; batch],
        };
        prev_losses = Some(row_losses);
    }

    let sequence = Tensor::cat(&triples, 1)?;
    let mut scored = Vec::new();
    for window in window_chunks(&sequence, budget.tok_p_rao(), num_rao)? {
        scored.push(neg_log_probs(model, &Tensor::cat(&[&anchor, &window], 1)?, true)?);
    }
    let losses = Tensor::cat(&scored, 1)?;
    let aggregate = losses.mean_all()?;
    if let Some(updater) = ctx.updater.as_mut() {
        updater.backward_step(&aggregate)?;
    }

    let means = split_rao(&losses.detach(), &budget)?.means()?;
    Ok(RaoOutcome {
        aggregate_loss: aggregate.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        weighted: weighted(&means, &budget),
        means,
        observation_losses,
        sequence,
    })
}

/// Train over a stream of documents. Returns the aggregate loss per document.
pub fn train_rao(ctx: &mut TrainContext<'_>, documents: DocumentStream) -> Result<Vec<f32>> {
    let budget = ctx.run.plan.budget;
    let mut history = Vec::new();
    for (batch_index, document) in documents.enumerate() {
        let document = document?;
        ctx.save_checkpoint(batch_index)?;
        let out = rao_step(ctx, &document)?;
        history.push(out.aggregate_loss);

        let n = out.sequence.dim(1)? / budget.tok_p_rao();
        if let Some(last) = n.checked_sub(1) {
            let tok = ctx.tokenizer;
            let prev_obs = match last.checked_sub(1) {
                Some(p) => decode_first_row(tok, &segment_of(&out.sequence, &budget, p, SegmentKind::Observation)?)?,
                None => String::new(),
            };
            let action = segment_of(&out.sequence, &budget, last, SegmentKind::Action)?;
            let obs = segment_of(&out.sequence, &budget, last, SegmentKind::Observation)?;
            let step = TrajectoryStep {
                batch_index,
                prev_obs,
                action: decode_first_row(tok, &action)?,
                obs: decode_first_row(tok, &obs)?,
                observation_loss: out.means.observation,
                value_loss: 0.0,
                negentropy: 0.0,
                perturbed_loss: None,
            };
            if let Some(store) = ctx.trajectory.as_mut() {
                store.append(step)?;
            }
        }

        let w = &out.weighted;
        ctx.log.scalars(
            batch_index,
            &[
                ("Aggregate loss", out.aggregate_loss as f64),
                ("Weighted loss loss", w.loss.unwrap_or(0.0) as f64),
                ("Weighted action loss", w.action.unwrap_or(0.0) as f64),
                ("Weighted observation loss", w.observation as f64),
            ],
        )?;
        if batch_index % ctx.run.init.interval_print == 0 {
            let m = &out.means;
            ctx.log.line(&format!(
                "Loss/Action/Observation loss: {}/{}/{}",
                m.loss.unwrap_or(0.0),
                m.action.unwrap_or(0.0),
                m.observation
            ))?;
            ctx.log.line(&format!(
                "Weighted Loss/Action/Observation loss: {}/{}/{}",
                w.loss.unwrap_or(0.0),
                w.action.unwrap_or(0.0),
                w.observation
            ))?;
        }
        ctx.log.line(&format!("Aggregate loss: {}", out.aggregate_loss))?;
    }
    tracing::info!("[RAO] finished after {} documents", history.len());
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::prefixed_row;
    use crate::config::{ConfigTier, RunConfig};
    use crate::logging::RunLog;
    use crate::tokenizer::{ByteTokenizer, TextTokenizer};
    use crate::trajectory::{SqliteTrajectoryLog, TrajectoryMetadata};
    use crate::transformer::RaoTransformer;
    use candle_core::Device;

    fn run(use_loss_difference: bool, dir: &std::path::Path) -> Result<RunConfig> {
        let mut init = ConfigTier::Test.initial_config();
        init.save_dir = dir.to_path_buf();
        init.mode = TrainingMode::Rao {
            num_rao: 2,
            obs_between_weight_updates: 3,
            tok_p_loss: 12,
            use_loss_difference,
        };
        RunConfig::derive(init, &ByteTokenizer, Device::Cpu)
    }

    fn document(run: &RunConfig, texts: &[&str]) -> Result<Tensor> {
        let tok = ByteTokenizer;
        let prefix = run.plan.prefix(SegmentKind::Observation)?;
        let pure = run.plan.pure_width(SegmentKind::Observation);
        let mut flat = Vec::new();
        for _ in 0..run.init.batch_size {
            for text in texts {
                flat.extend(prefixed_row(prefix, &tok.encode(text)?, pure, tok.pad_id()));
            }
        }
        let width = run.plan.width(SegmentKind::Observation);
        Ok(Tensor::from_vec(flat, (run.init.batch_size, texts.len(), width), &Device::Cpu)?)
    }

    fn metadata() -> TrajectoryMetadata {
        TrajectoryMetadata {
            model: "tiny".into(),
            lr: 1e-3,
            batch_size: 2,
            num_batches: 2,
            optimizer: "sgd".into(),
            dataset: serde_json::Value::Null,
            perturbation: serde_json::Value::Null,
            trainer: "rao".into(),
            inference: serde_json::Value::Null,
            prediction: "observation".into(),
        }
    }

    #[test]
    fn test_rao_step_builds_aligned_sequence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let run = run(false, dir.path())?;
        let model = RaoTransformer::new(run.init.model.transformer.clone(), &Device::Cpu)?;
        let tok = ByteTokenizer;
        let mut ctx = TrainContext::new(&run, &model, &tok, RunLog::console(), None)?;

        let doc = document(&run, &["one fish", "two fish", "red fish"])?;
        let out = rao_step(&mut ctx, &doc)?;
        let budget = run.plan.budget;

        assert_eq!(out.sequence.dims2()?, (2, 3 * budget.tok_p_rao()));
        assert!(out.aggregate_loss.is_finite());
        assert_eq!(out.observation_losses.len(), 3);
        assert!(out.means.loss.is_some() && out.means.action.is_some());
        assert_eq!(ctx.updater().map(|u| u.step_count()), Some(1));

        let first_loss = decode_first_row(&tok, &segment_of(&out.sequence, &budget, 0, SegmentKind::Loss)?)?;
        assert_eq!(first_loss, "\nLoss: 0.000");
        let obs = decode_first_row(&tok, &segment_of(&out.sequence, &budget, 2, SegmentKind::Observation)?)?;
        assert_eq!(obs, "\nObservation: red fish");
        let action = decode_first_row(&tok, &segment_of(&out.sequence, &budget, 1, SegmentKind::Action)?)?;
        assert!(action.starts_with("\nAction: "));
        Ok(())
    }

    #[test]
    fn test_loss_difference_starts_at_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let run = run(true, dir.path())?;
        let model = RaoTransformer::new(run.init.model.transformer.clone(), &Device::Cpu)?;
        let tok = ByteTokenizer;
        let mut ctx = TrainContext::new(&run, &model, &tok, RunLog::console(), None)?;

        let out = rao_step(&mut ctx, &document(&run, &["a b c", "d e f", "g h i"])?)?;
        let budget = run.plan.budget;
        for i in 0..2 {
            let seg = segment_of(&out.sequence, &budget, i, SegmentKind::Loss)?;
            assert_eq!(decode_first_row(&tok, &seg)?, "\nLoss: 0.000");
        }
        Ok(())
    }

    #[test]
    fn test_train_rao_records_each_document() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let run = run(false, dir.path())?;
        let model = RaoTransformer::new(run.init.model.transformer.clone(), &Device::Cpu)?;
        let tok = ByteTokenizer;
        let store = SqliteTrajectoryLog::open(&dir.path().join("rao.sqlite"), &metadata())?;
        let mut ctx = TrainContext::new(&run, &model, &tok, RunLog::console(), Some(Box::new(store)))?;

        let docs: Vec<Result<Tensor>> = vec![
            document(&run, &["x1", "x2", "x3"]),
            document(&run, &["y1", "y2", "y3"]),
        ];
        let history = train_rao(&mut ctx, Box::new(docs.into_iter()))?;
        assert_eq!(history.len(), 2);
        assert_eq!(ctx.trajectory().map(|t| t.len()).transpose()?, Some(2));
        Ok(())
    }
}
