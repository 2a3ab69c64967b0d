// Action perturbations used to measure how much the observation loss depends on
// the action content.

use anyhow::Result;
use candle_core::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::budget::{fit_to_width, PadSide};
use crate::error::ensure_config;
use crate::tokenizer::TextTokenizer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbationConfig {
    /// Re-score with a perturbed action every this many steps.
    pub eval_every: usize,
    pub frac_of_tokens_to_randomize: f64,
    pub frac_of_tokens_to_pad: f64,
    #[serde(default)]
    pub p_digit_change: f64,
}

impl PerturbationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.eval_every >= 1, "perturbation eval_every must be at least 1");
        for (name, v) in [
            ("frac_of_tokens_to_randomize", self.frac_of_tokens_to_randomize),
            ("frac_of_tokens_to_pad", self.frac_of_tokens_to_pad),
            ("p_digit_change", self.p_digit_change),
        ] {
            ensure_config!((0.0..=1.0).contains(&v), "{name} is {v}, expected 0..=1");
        }
        Ok(())
    }

    fn randomize(frac: f64) -> Self {
        Self { eval_every: 10, frac_of_tokens_to_randomize: frac, frac_of_tokens_to_pad: 0.0, p_digit_change: 0.0 }
    }

    fn spaces(frac: f64) -> Self {
        Self { eval_every: 10, frac_of_tokens_to_randomize: 0.0, frac_of_tokens_to_pad: frac, p_digit_change: 0.0 }
    }

    /// Named perturbation set used by the action evaluator.
    pub fn evaluation_set() -> Vec<(String, PerturbationConfig)> {
        let mut set = Vec::new();
        for pct in [50, 25, 10] {
            set.push((format!("{pct}%Rand"), Self::randomize(pct as f64 / 100.0)));
        }
        for pct in [50, 25, 10] {
            set.push((format!("{pct}%Spaces"), Self::spaces(pct as f64 / 100.0)));
        }
        set
    }
}

/// Applies perturbations to `(batch, width)` action tensors whose first
/// `offset` tokens are the action label, which is never touched.
pub struct ActionPerturber<'a> {
    tokenizer: &'a dyn TextTokenizer,
    offset: usize,
}

impl<'a> ActionPerturber<'a> {
    pub fn new(tokenizer: &'a dyn TextTokenizer, offset: usize) -> Self {
        Self { tokenizer, offset }
    }

    pub fn perturb(&self, action: &Tensor, cfg: &PerturbationConfig, rng: &mut impl Rng) -> Result<Tensor> {
        cfg.validate()?;
        let (batch, width) = action.dims2()?;
        let mut rows = action.to_vec2::<u32>()?;
        let content = width.saturating_sub(self.offset);

        // Same positions and ids in every row.
        let n_random = (cfg.frac_of_tokens_to_randomize * content as f64) as usize;
        if content > 0 {
            let vocab = self.tokenizer.vocab_size() as u32;
            for _ in 0..n_random {
                let pos = rng.gen_range(self.offset..width);
                let id = rng.gen_range(0..vocab);
                for row in rows.iter_mut() {
                    row[pos] = id;
                }
            }
        }

        let keep = self.offset + ((1.0 - cfg.frac_of_tokens_to_pad) * content as f64) as usize;
        if keep < width {
            let space = self.tokenizer.space_id()?;
            for row in rows.iter_mut() {
                row[keep..].fill(space);
            }
        }

        if cfg.p_digit_change > 0.0 {
            let pad = self.tokenizer.pad_id();
            for row in rows.iter_mut() {
                let text = self.tokenizer.decode(row)?;
                let changed = randomize_digits(&text, cfg.p_digit_change, rng);
                *row = fit_to_width(&self.tokenizer.encode(&changed)?, width, pad, PadSide::Right);
            }
        }

        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (batch, width), action.device())?)
    }
}

/// Replace each ASCII digit, with probability `p`, by a uniformly random digit.
pub fn randomize_digits(text: &str, p: f64, rng: &mut impl Rng) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_digit() && rng.gen::<f64>() < p {
                char::from(b'0' + rng.gen_range(0..10u8))
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn action(width: usize) -> Result<Tensor> {
        let row: Vec<u32> = (0..width as u32).map(|i| b'a' as u32 + i % 26).collect();
        let data: Vec<u32> = row.iter().chain(row.iter()).copied().collect();
        Ok(Tensor::from_vec(data, (2, width), &Device::Cpu)?)
    }

    #[test]
    fn test_pad_fraction_fills_tail_with_spaces() -> Result<()> {
        let tok = ByteTokenizer;
        let p = ActionPerturber::new(&tok, 4);
        let cfg = PerturbationConfig::spaces(0.5);
        let out = p.perturb(&action(14)?, &cfg, &mut StdRng::seed_from_u64(1))?.to_vec2::<u32>()?;
        let original = action(14)?.to_vec2::<u32>()?;
        // 10 content tokens, the last 5 become spaces
        assert_eq!(out[0][..9], original[0][..9]);
        assert!(out[0][9..].iter().all(|&t| t == b' ' as u32));
        assert_eq!(out[0], out[1]);
        Ok(())
    }

    #[test]
    fn test_randomize_keeps_label_and_width() -> Result<()> {
        let tok = ByteTokenizer;
        let p = ActionPerturber::new(&tok, 4);
        let cfg = PerturbationConfig::randomize(1.0);
        let before = action(20)?;
        let out = p.perturb(&before, &cfg, &mut StdRng::seed_from_u64(3))?;
        assert_eq!(out.dims2()?, (2, 20));
        let (a, b) = (before.to_vec2::<u32>()?, out.to_vec2::<u32>()?);
        assert_eq!(a[0][..4], b[0][..4]);
        // positions are shared across the batch
        let changed0: Vec<bool> = (0..20).map(|i| a[0][i] != b[0][i]).collect();
        let changed1: Vec<bool> = (0..20).map(|i| a[1][i] != b[1][i]).collect();
        assert_eq!(changed0, changed1);
        Ok(())
    }

    #[test]
    fn test_zero_perturbation_is_identity() -> Result<()> {
        let tok = ByteTokenizer;
        let p = ActionPerturber::new(&tok, 4);
        let cfg = PerturbationConfig::randomize(0.0);
        let before = action(12)?;
        let out = p.perturb(&before, &cfg, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(before.to_vec2::<u32>()?, out.to_vec2::<u32>()?);
        Ok(())
    }

    #[test]
    fn test_randomize_digits() {
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(randomize_digits("a1b2", 0.0, &mut rng), "a1b2");
        let out = randomize_digits("x 12345 y", 1.0, &mut rng);
        assert_eq!(out.len(), 9);
        assert!(out.starts_with("x ") && out.ends_with(" y"));
        assert!(out[2..7].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let cfg = PerturbationConfig::spaces(1.5);
        assert!(cfg.validate().is_err());
        let cfg = PerturbationConfig { eval_every: 0, ..PerturbationConfig::randomize(0.1) };
        assert!(cfg.validate().is_err());
    }
}
