// Segmented losses.
//
// Everything starts from the shift-by-one NLL: logits at positions [0, len-1)
// scored against tokens [1, len). For a RAO sequence that position axis is cut
// into tok_p_rao spans and each span into its loss/action/observation ranges.

use anyhow::{ensure, Result};
use candle_core::{Tensor, D};

use crate::budget::{SegmentKind, TokenBudget};
use crate::error::RaoError;
use crate::model::CausalLm;

/// Ratio clip range of the actor term.
pub const CLIP_LOW: f64 = 0.7;
pub const CLIP_HIGH: f64 = 1.3;

// ---------------------------------------------------------------------------
// Per-position NLL
// ---------------------------------------------------------------------------

/// (batch, len) ids -> (batch, len - 1) negative log-likelihoods, unreduced.
pub fn neg_log_probs(model: &dyn CausalLm, seq: &Tensor, use_adapter: bool) -> Result<Tensor> {
    let logits = model.logits(seq, use_adapter)?;
    nll_from_logits(&logits, seq)
}

pub fn nll_from_logits(logits: &Tensor, seq: &Tensor) -> Result<Tensor> {
    let len = seq.dim(1)?;
    ensure!(len >= 2, "need at least two tokens to score, got {len}");
    let logits = logits.narrow(1, 0, len - 1)?;
    let targets = seq.narrow(1, 1, len - 1)?.contiguous()?.unsqueeze(D::Minus1)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    log_probs
        .gather(&targets, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// RAO split
// ---------------------------------------------------------------------------

/// Per-kind losses, each the concatenation of that kind's range from every span.
#[derive(Clone, Debug)]
pub struct RaoLossSplit {
    pub budget: TokenBudget,
    pub n_triples: usize,
    pub loss: Option<Tensor>,
    pub action: Option<Tensor>,
    pub observation: Tensor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentMeans {
    pub loss: Option<f32>,
    pub action: Option<f32>,
    pub observation: f32,
}

/// Split a (batch, n * tok_p_rao) loss tensor by segment kind.
pub fn split_rao(losses: &Tensor, budget: &TokenBudget) -> Result<RaoLossSplit> {
    let len = losses.dim(1)?;
    let rao = budget.tok_p_rao();
    if rao == 0 || len % rao != 0 {
        return Err(RaoError::SegmentMisaligned { len, tok_p_rao: rao }.into());
    }
    let n_triples = len / rao;
    let gather = |offset: usize, width: usize| -> Result<Option<Tensor>> {
        if width == 0 {
            return Ok(None);
        }
        let parts = (0..n_triples)
            .map(|i| losses.narrow(1, i * rao + offset, width))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Some(Tensor::cat(&parts, 1)?))
    };
    let (l, a) = (budget.tok_p_loss, budget.tok_p_action);
    let observation = match gather(l + a, budget.tok_p_obs)? {
        Some(t) => t,
        None => anyhow::bail!("observation width is zero"),
    };
    Ok(RaoLossSplit {
        budget: *budget,
        n_triples,
        loss: gather(0, l)?,
        action: gather(l, a)?,
        observation,
    })
}

impl RaoLossSplit {
    pub fn get(&self, kind: SegmentKind) -> Option<&Tensor> {
        match kind {
            SegmentKind::Loss => self.loss.as_ref(),
            SegmentKind::Action => self.action.as_ref(),
            SegmentKind::Observation => Some(&self.observation),
        }
    }

    /// Scalar mean over all positions of one kind.
    pub fn mean(&self, kind: SegmentKind) -> Result<Option<Tensor>> {
        match self.get(kind) {
            Some(t) => Ok(Some(t.mean_all()?)),
            None => Ok(None),
        }
    }

    pub fn means(&self) -> Result<SegmentMeans> {
        let scalar = |kind| -> Result<Option<f32>> {
            match self.mean(kind)? {
                Some(t) => Ok(Some(t.to_scalar::<f32>()?)),
                None => Ok(None),
            }
        };
        Ok(SegmentMeans {
            loss: scalar(SegmentKind::Loss)?,
            action: scalar(SegmentKind::Action)?,
            observation: self.observation.mean_all()?.to_scalar::<f32>()?,
        })
    }

    /// Inverse of `split_rao`: reinterleave the kinds span by span.
    pub fn rejoin(&self) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(self.n_triples * 3);
        for i in 0..self.n_triples {
            for kind in SegmentKind::ALL {
                let width = self.budget.width(kind);
                if let Some(t) = self.get(kind) {
                    parts.push(t.narrow(1, i * width, width)?);
                }
            }
        }
        Tensor::cat(&parts, 1).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Action / observation scoring
// ---------------------------------------------------------------------------

/// How the model scores an action in context.
pub struct ActionScore {
    /// Mean NLL over the action tokens, (batch).
    pub loss: Tensor,
    /// Critic estimates at the action positions, (batch, action_width).
    pub values: Tensor,
    /// Mean of sum(p log p) over the action positions, (batch).
    pub negentropy: Tensor,
}

/// Score `action` given `[prev_action, prev_obs]`.
pub fn predict_action(
    model: &dyn CausalLm,
    prev_action: &Tensor,
    prev_obs: &Tensor,
    action: &Tensor,
    use_adapter: bool,
) -> Result<ActionScore> {
    let width = action.dim(1)?;
    let input = Tensor::cat(&[prev_action, prev_obs, action], 1)?;
    let len = input.dim(1)?;

    let logits = model.logits(&input, use_adapter)?;
    let nll = nll_from_logits(&logits, &input)?;
    let loss = nll.narrow(1, nll.dim(1)? - width, width)?.mean(1)?;

    // Distributions that produced the action tokens.
    let action_logits = logits.narrow(1, len - 1 - width, width)?;
    let log_probs = candle_nn::ops::log_softmax(&action_logits, D::Minus1)?;
    let negentropy = (log_probs.exp()? * &log_probs)?.sum(D::Minus1)?.mean(1)?;

    let values = model.values(&input)?.narrow(1, len - width, width)?;
    Ok(ActionScore { loss, values, negentropy })
}

/// Mean NLL of `obs` given `context`, per batch row: (batch).
pub fn predict_observation(
    model: &dyn CausalLm,
    context: &Tensor,
    obs: &Tensor,
    use_adapter: bool,
) -> Result<Tensor> {
    let width = obs.dim(1)?;
    let input = Tensor::cat(&[context, obs], 1)?;
    let nll = neg_log_probs(model, &input, use_adapter)?;
    nll.narrow(1, nll.dim(1)? - width, width)?.mean(1).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Aggregate objective
// ---------------------------------------------------------------------------

pub struct ObjectiveInputs<'a> {
    /// (batch) observation loss after the current action.
    pub obs_loss: &'a Tensor,
    /// (batch) observation loss after the baseline action.
    pub default_obs_loss: &'a Tensor,
    /// (batch, k) critic estimates.
    pub values: &'a Tensor,
    /// (batch) action NLL under the trainable policy.
    pub action_loss: &'a Tensor,
    /// (batch) action NLL under the frozen policy.
    pub old_action_loss: &'a Tensor,
    /// (batch)
    pub negentropy: &'a Tensor,
}

pub struct Objective {
    pub aggregate: Tensor,
    pub value_loss: Tensor,
    pub normalized_obs: Tensor,
    pub ratio: Tensor,
}

/// aggregate = mean(max(r * A, clip(r) * A)) + mean|V - n|
///   n = obs_loss - default_obs_loss
///   r = exp(old_action_loss - action_loss)
///   A = mean(negentropy + n - stopgrad(V))
pub fn aggregate_objective(inputs: &ObjectiveInputs<'_>) -> Result<Objective> {
    let normalized_obs = (inputs.obs_loss - inputs.default_obs_loss)?;
    let repeated = normalized_obs
        .unsqueeze(1)?
        .broadcast_as(inputs.values.shape())?
        .contiguous()?;
    let value_loss = (inputs.values - &repeated)?.abs()?.mean_all()?;

    let ratio = (inputs.old_action_loss - inputs.action_loss)?.exp()?;
    let clipped = ratio.clamp(CLIP_LOW, CLIP_HIGH)?;

    let per_row = (inputs.negentropy + &normalized_obs)?.unsqueeze(1)?;
    let neg_adv = per_row.broadcast_sub(&inputs.values.detach())?.mean_all()?;

    let actor = ratio.broadcast_mul(&neg_adv)?.maximum(&clipped.broadcast_mul(&neg_adv)?)?;
    let aggregate = (actor.mean_all()? + &value_loss)?;
    Ok(Objective { aggregate, value_loss, normalized_obs, ratio })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::{RaoTransformer, TransformerConfig};
    use candle_core::{DType, Device};

    fn ramp(len: usize) -> Result<Tensor> {
        let data: Vec<f32> = (0..2 * len).map(|i| i as f32).collect();
        Tensor::from_vec(data, (2, len), &Device::Cpu).map_err(Into::into)
    }

    #[test]
    fn test_split_rejoin_identity() -> Result<()> {
        let budget = TokenBudget { tok_p_loss: 2, tok_p_action: 3, tok_p_obs: 5 };
        let losses = ramp(30)?;
        let split = split_rao(&losses, &budget)?;
        assert_eq!(split.n_triples, 3);
        assert_eq!(split.loss.as_ref().map(|t| t.dims2()).transpose()?, Some((2, 6)));
        assert_eq!(split.observation.dims2()?, (2, 15));
        assert_eq!(split.rejoin()?.to_vec2::<f32>()?, losses.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_split_offsets() -> Result<()> {
        let budget = TokenBudget { tok_p_loss: 1, tok_p_action: 1, tok_p_obs: 2 };
        let losses = Tensor::new(&[[0f32, 1., 2., 2., 0., 1., 2., 2.]], &Device::Cpu)?;
        let means = split_rao(&losses, &budget)?.means()?;
        assert_eq!(means.loss, Some(0.0));
        assert_eq!(means.action, Some(1.0));
        assert_eq!(means.observation, 2.0);
        Ok(())
    }

    #[test]
    fn test_split_without_loss_segment() -> Result<()> {
        let budget = TokenBudget { tok_p_loss: 0, tok_p_action: 2, tok_p_obs: 2 };
        let losses = ramp(8)?;
        let split = split_rao(&losses, &budget)?;
        assert!(split.loss.is_none());
        assert_eq!(split.rejoin()?.to_vec2::<f32>()?, losses.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_split_misaligned() -> Result<()> {
        let budget = TokenBudget { tok_p_loss: 2, tok_p_action: 3, tok_p_obs: 5 };
        let err = split_rao(&ramp(29)?, &budget).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RaoError>(),
            Some(RaoError::SegmentMisaligned { len: 29, tok_p_rao: 10 })
        ));
        Ok(())
    }

    #[test]
    fn test_neg_log_probs_shape_and_sign() -> Result<()> {
        let model = RaoTransformer::new(TransformerConfig::tiny(), &Device::Cpu)?;
        let seq = Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 9, 10]], &Device::Cpu)?;
        let nll = neg_log_probs(&model, &seq, false)?;
        assert_eq!(nll.dims2()?, (2, 4));
        for row in nll.to_vec2::<f32>()? {
            assert!(row.iter().all(|v| v.is_finite() && *v > 0.0));
        }
        Ok(())
    }

    #[test]
    fn test_nll_matches_cross_entropy() -> Result<()> {
        let logits = Tensor::randn(0f32, 1.0, (1, 4, 7), &Device::Cpu)?;
        let seq = Tensor::new(&[[0u32, 3, 5, 1]], &Device::Cpu)?;
        let ours = nll_from_logits(&logits, &seq)?.mean_all()?.to_scalar::<f32>()?;
        let flat = logits.narrow(1, 0, 3)?.squeeze(0)?;
        let reference = candle_nn::loss::cross_entropy(&flat, &Tensor::new(&[3u32, 5, 1], &Device::Cpu)?)?
            .to_scalar::<f32>()?;
        assert!((ours - reference).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_predict_action_shapes() -> Result<()> {
        let model = RaoTransformer::new(TransformerConfig::tiny(), &Device::Cpu)?;
        let pa = Tensor::zeros((2, 4), DType::U32, &Device::Cpu)?;
        let po = Tensor::ones((2, 6), DType::U32, &Device::Cpu)?;
        let a = Tensor::full(2u32, (2, 4), &Device::Cpu)?;
        let score = predict_action(&model, &pa, &po, &a, true)?;
        assert_eq!(score.loss.dims1()?, 2);
        assert_eq!(score.values.dims2()?, (2, 4));
        for v in score.negentropy.to_vec1::<f32>()? {
            assert!(v <= 0.0, "negentropy must be <= 0, got {v}");
        }
        let obs = predict_observation(&model, &a, &po, false)?;
        assert_eq!(obs.dims1()?, 2);
        Ok(())
    }

    #[test]
    fn test_aggregate_objective_values() -> Result<()> {
        let dev = Device::Cpu;
        let obs = Tensor::new(&[2.0f32, 3.0], &dev)?;
        let default_obs = Tensor::new(&[1.0f32, 1.0], &dev)?;
        let values = Tensor::new(&[[1.0f32, 1.0], [2.0, 2.0]], &dev)?;
        let action = Tensor::new(&[1.0f32, 1.0], &dev)?;
        let old_action = Tensor::new(&[1.0f32, 1.0], &dev)?;
        let negentropy = Tensor::new(&[-0.5f32, -0.5], &dev)?;
        let obj = aggregate_objective(&ObjectiveInputs {
            obs_loss: &obs,
            default_obs_loss: &default_obs,
            values: &values,
            action_loss: &action,
            old_action_loss: &old_action,
            negentropy: &negentropy,
        })?;
        // normalized = [1, 2] equals values row-wise -> value loss 0
        assert!(obj.value_loss.to_scalar::<f32>()?.abs() < 1e-6);
        // ratio 1, neg_adv = mean(-0.5 + n - V) = -0.5
        assert!((obj.aggregate.to_scalar::<f32>()? + 0.5).abs() < 1e-6);
        assert_eq!(obj.ratio.to_vec1::<f32>()?, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_aggregate_objective_clips_ratio() -> Result<()> {
        let dev = Device::Cpu;
        let zeros = Tensor::zeros(1, DType::F32, &dev)?;
        let values = Tensor::zeros((1, 1), DType::F32, &dev)?;
        // old - new = 1 -> ratio e, clipped 1.3; neg_adv = 1 -> max(e, 1.3) = e
        let action = Tensor::new(&[0.0f32], &dev)?;
        let old_action = Tensor::new(&[1.0f32], &dev)?;
        let negentropy = Tensor::new(&[1.0f32], &dev)?;
        let obj = aggregate_objective(&ObjectiveInputs {
            obs_loss: &zeros,
            default_obs_loss: &zeros,
            values: &values,
            action_loss: &action,
            old_action_loss: &old_action,
            negentropy: &negentropy,
        })?;
        let e = std::f32::consts::E;
        assert!((obj.aggregate.to_scalar::<f32>()? - e).abs() < 1e-5);

        // neg_adv = -1 -> max(-e, -1.3) = -1.3
        let negentropy = Tensor::new(&[-1.0f32], &dev)?;
        let obj = aggregate_objective(&ObjectiveInputs {
            obs_loss: &zeros,
            default_obs_loss: &zeros,
            values: &values,
            action_loss: &action,
            old_action_loss: &old_action,
            negentropy: &negentropy,
        })?;
        assert!((obj.aggregate.to_scalar::<f32>()? + 1.3).abs() < 1e-5);
        Ok(())
    }
}
