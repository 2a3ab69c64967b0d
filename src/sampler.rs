// Constrained action sampling.
//
// An action is exactly `width(Action)` tokens: the action label followed by
// `pure_width(Action)` generated tokens. Generation never stops early, never
// emits pad or eos, and drops non-finite logits before renormalizing.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::assemble::repeat_interleave;
use crate::budget::{Prefix, SegmentKind, SegmentPlan};
use crate::error::RaoError;
use crate::model::CausalLm;
use crate::tokenizer::TextTokenizer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// 0 selects greedy decoding.
    pub temperature: f64,
    pub num_return_sequences: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { temperature: 0.0, num_return_sequences: 1 }
    }
}

pub struct ActionSampler {
    prefix: Prefix,
    pure_width: usize,
    config: SamplingConfig,
    banned: [u32; 2],
}

impl ActionSampler {
    pub fn new(plan: &SegmentPlan, config: SamplingConfig, tokenizer: &dyn TextTokenizer) -> Result<Self> {
        let prefix = plan.prefix(SegmentKind::Action)?.clone();
        Ok(Self {
            prefix,
            pure_width: plan.pure_width(SegmentKind::Action),
            config,
            banned: [tokenizer.pad_id(), tokenizer.eos_id()],
        })
    }

    pub fn width(&self) -> usize {
        self.prefix.len() + self.pure_width
    }

    /// Continue `[prev_action, prev_obs, action_label]` by exactly the pure
    /// action width. Returns (batch * num_return_sequences, width) where each
    /// input row is repeated `num_return_sequences` times in place.
    pub fn sample(
        &self,
        model: &dyn CausalLm,
        prev_action: &Tensor,
        prev_obs: &Tensor,
        use_adapter: bool,
    ) -> Result<Tensor> {
        let context = Tensor::cat(&[prev_action, prev_obs], 1)?;
        let context = repeat_interleave(&context, self.config.num_return_sequences)?;
        self.continue_context(model, &context, use_adapter)
    }

    /// One action per row of `context`: the label followed by the pure action
    /// width of generated tokens, (rows, width).
    pub fn continue_context(&self, model: &dyn CausalLm, context: &Tensor, use_adapter: bool) -> Result<Tensor> {
        let rows = context.dim(0)?;
        let device = context.device();
        let label = Tensor::new(self.prefix.ids.as_slice(), device)?
            .unsqueeze(0)?
            .repeat((rows, 1))?;
        let mut seq = Tensor::cat(&[context, &label], 1)?;

        let requested = seq.dim(1)? + self.pure_width;
        if requested > model.max_positions() {
            return Err(RaoError::LengthExceeded { requested, max: model.max_positions() }.into());
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.pure_width {
            let s = seq.dim(1)?;
            let last = model
                .logits(&seq, use_adapter)?
                .narrow(1, s - 1, 1)?
                .squeeze(1)?
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?;
            let next = last
                .iter()
                .map(|row| self.choose(row, &mut rng))
                .collect::<Result<Vec<u32>>>()?;
            let next = Tensor::from_vec(next, (rows, 1), device)?;
            seq = Tensor::cat(&[&seq, &next], 1)?;
        }
        let width = self.width();
        seq.narrow(1, seq.dim(1)? - width, width).map_err(Into::into)
    }

    fn choose(&self, logits: &[f32], rng: &mut impl Rng) -> Result<u32> {
        let log_probs = admissible_log_probs(logits, &self.banned)?;
        if self.config.temperature <= 0.0 {
            return Ok(argmax(&log_probs));
        }
        Ok(sample_with_temperature(&log_probs, self.config.temperature, rng))
    }
}

/// Mask banned ids and non-finite entries to -inf, then log-softmax.
pub fn admissible_log_probs(logits: &[f32], banned: &[u32]) -> Result<Vec<f32>> {
    let mut out: Vec<f32> = logits
        .iter()
        .map(|&l| if l.is_finite() { l } else { f32::NEG_INFINITY })
        .collect();
    for &id in banned {
        if let Some(l) = out.get_mut(id as usize) {
            *l = f32::NEG_INFINITY;
        }
    }
    let max = out.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        bail!("no admissible token left after masking");
    }
    let log_z = max + out.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
    for l in out.iter_mut() {
        *l -= log_z;
    }
    Ok(out)
}

fn argmax(xs: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &x) in xs.iter().enumerate() {
        if x > xs[best] {
            best = i;
        }
    }
    best as u32
}

/// Temperature sampling over (log-)probabilities. -inf entries are never drawn.
pub fn sample_with_temperature(log_probs: &[f32], temperature: f64, rng: &mut impl Rng) -> u32 {
    let temp = temperature as f32;
    let max = log_probs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = log_probs.iter().map(|&l| ((l - max) / temp).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumulative = 0.0f32;
    let mut last_live = 0usize;
    for (i, &p) in exps.iter().enumerate() {
        if p == 0.0 {
            continue;
        }
        last_live = i;
        cumulative += p;
        if r < cumulative {
            return i as u32;
        }
    }
    last_live as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TokenBudget;
    use crate::model::TrainScope;
    use crate::tokenizer::{ByteTokenizer, BYTE_EOS, BYTE_PAD, BYTE_VOCAB_SIZE};
    use candle_core::{Device, Var};
    use std::path::Path;

    /// Always prefers pad, then eos, then `favourite`; one logit is NaN.
    struct LoudLm {
        favourite: u32,
        max_positions: usize,
    }

    impl CausalLm for LoudLm {
        fn logits(&self, ids: &Tensor, _use_adapter: bool) -> Result<Tensor> {
            let (b, s) = ids.dims2()?;
            let mut row = vec![0.0f32; BYTE_VOCAB_SIZE];
            row[BYTE_PAD as usize] = 100.0;
            row[BYTE_EOS as usize] = 90.0;
            row[self.favourite as usize] = 10.0;
            row[0] = f32::NAN;
            row[1] = f32::INFINITY;
            let data: Vec<f32> = (0..b * s).flat_map(|_| row.clone()).collect();
            Tensor::from_vec(data, (b, s, BYTE_VOCAB_SIZE), ids.device()).map_err(Into::into)
        }

        fn values(&self, ids: &Tensor) -> Result<Tensor> {
            Tensor::zeros(ids.dims2()?, DType::F32, ids.device()).map_err(Into::into)
        }

        fn max_positions(&self) -> usize {
            self.max_positions
        }

        fn vocab_size(&self) -> usize {
            BYTE_VOCAB_SIZE
        }

        fn trainable_vars(&self, _scope: TrainScope) -> Vec<Var> {
            Vec::new()
        }

        fn save(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn load(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn setup(config: SamplingConfig) -> Result<(SegmentPlan, ActionSampler)> {
        let tok = ByteTokenizer;
        let budget = TokenBudget::action_observation(90, 2.0)?;
        let plan = SegmentPlan::build(budget, &tok, 2, &Device::Cpu)?;
        let sampler = ActionSampler::new(&plan, config, &tok)?;
        Ok((plan, sampler))
    }

    #[test]
    fn test_greedy_skips_pad_eos_and_nonfinite() -> Result<()> {
        let (plan, sampler) = setup(SamplingConfig::default())?;
        let lm = LoudLm { favourite: b'x' as u32, max_positions: 256 };
        let pa = Tensor::zeros((2, plan.width(SegmentKind::Action)), DType::U32, &Device::Cpu)?;
        let po = Tensor::zeros((2, plan.width(SegmentKind::Observation)), DType::U32, &Device::Cpu)?;

        let action = sampler.sample(&lm, &pa, &po, true)?;
        assert_eq!(action.dims2()?, (2, plan.width(SegmentKind::Action)));
        let text = ByteTokenizer.decode(&action.to_vec2::<u32>()?[0])?;
        let pure = plan.pure_width(SegmentKind::Action);
        assert_eq!(text, format!("\nAction: {}", "x".repeat(pure)));
        Ok(())
    }

    #[test]
    fn test_stochastic_never_emits_banned() -> Result<()> {
        let config = SamplingConfig { temperature: 1.0, num_return_sequences: 3 };
        let (plan, sampler) = setup(config)?;
        let lm = LoudLm { favourite: b'y' as u32, max_positions: 256 };
        let pa = Tensor::zeros((2, plan.width(SegmentKind::Action)), DType::U32, &Device::Cpu)?;
        let po = Tensor::zeros((2, plan.width(SegmentKind::Observation)), DType::U32, &Device::Cpu)?;

        let action = sampler.sample(&lm, &pa, &po, false)?;
        assert_eq!(action.dim(0)?, 6);
        for row in action.to_vec2::<u32>()? {
            assert!(row.iter().all(|&t| t != BYTE_PAD && t != BYTE_EOS && t != 0 && t != 1));
        }
        Ok(())
    }

    #[test]
    fn test_length_exceeded() -> Result<()> {
        let (plan, sampler) = setup(SamplingConfig::default())?;
        let lm = LoudLm { favourite: 5, max_positions: 40 };
        let pa = Tensor::zeros((2, plan.width(SegmentKind::Action)), DType::U32, &Device::Cpu)?;
        let po = Tensor::zeros((2, plan.width(SegmentKind::Observation)), DType::U32, &Device::Cpu)?;
        let err = sampler.sample(&lm, &pa, &po, true).unwrap_err();
        assert!(matches!(err.downcast_ref::<RaoError>(), Some(RaoError::LengthExceeded { max: 40, .. })));
        Ok(())
    }

    #[test]
    fn test_admissible_log_probs_normalized() -> Result<()> {
        let lp = admissible_log_probs(&[1.0, f32::NAN, 2.0, 3.0], &[3])?;
        assert_eq!(lp[1], f32::NEG_INFINITY);
        assert_eq!(lp[3], f32::NEG_INFINITY);
        let total: f32 = lp.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(admissible_log_probs(&[f32::NAN, 1.0], &[1]).is_err());
        Ok(())
    }
}
