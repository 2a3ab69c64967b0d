// Token budgeting: how many positions each segment kind gets inside the
// context window, and the literal label prefixes that open every segment.
//
//   Rao:               tok_p_action = floor(ctx / ((r+1)(N+1)) - tok_p_loss/(r+1))
//   ActionObservation: tok_p_action = floor(ctx / (r+2))
//   ObservationOnly:   tok_p_obs    = ctx / 2
//   everywhere:        tok_p_obs    = floor(tok_p_action * r)
//
// All checks happen here, before any model call.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ensure_config;
use crate::tokenizer::TextTokenizer;

// ---------------------------------------------------------------------------
// Segment kinds
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Loss,
    Action,
    Observation,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 3] = [Self::Loss, Self::Action, Self::Observation];

    /// Literal label that starts every segment of this kind.
    pub fn label(self) -> &'static str {
        match self {
            Self::Loss => "\nLoss: ",
            Self::Action => "\nAction: ",
            Self::Observation => "\nObservation: ",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Loss => "loss",
            Self::Action => "action",
            Self::Observation => "observation",
        }
    }
}

// ---------------------------------------------------------------------------
// Token budget
// ---------------------------------------------------------------------------

/// Widths (prefix included) of the three segment kinds. A zero width means the
/// kind does not appear in this training mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub tok_p_loss: usize,
    pub tok_p_action: usize,
    pub tok_p_obs: usize,
}

impl TokenBudget {
    /// Loss-bearing layout: `num_rao` triples plus one triple of headroom fit in `ctx`.
    pub fn rao(ctx: usize, ratio: f64, num_rao: usize, tok_p_loss: usize) -> Result<Self> {
        check_ratio(ratio)?;
        ensure_config!(num_rao >= 1, "num_rao must be at least 1");
        ensure_config!(
            tok_p_loss < ctx,
            "tok_p_loss={tok_p_loss} must be smaller than the context window ({ctx})"
        );
        let per_window = ctx as f64 / ((ratio + 1.0) * (num_rao as f64 + 1.0));
        let action = (per_window - tok_p_loss as f64 / (ratio + 1.0)).floor();
        ensure_config!(
            action >= 1.0,
            "no room for actions: ctx={ctx} ratio={ratio} num_rao={num_rao} tok_p_loss={tok_p_loss}"
        );
        let tok_p_action = action as usize;
        let budget = Self {
            tok_p_loss,
            tok_p_action,
            tok_p_obs: (tok_p_action as f64 * ratio).floor() as usize,
        };
        ensure_config!(
            (num_rao + 1) * budget.tok_p_rao() <= ctx,
            "{} triples of {} tokens overflow the context window ({ctx})",
            num_rao + 1,
            budget.tok_p_rao()
        );
        Ok(budget)
    }

    /// Single-step layout scoring `[prev_action, prev_obs, action]` then `[action, obs]`.
    pub fn action_observation(ctx: usize, ratio: f64) -> Result<Self> {
        check_ratio(ratio)?;
        let tok_p_action = (ctx as f64 / (ratio + 2.0)).floor() as usize;
        ensure_config!(tok_p_action >= 1, "context window {ctx} too small for ratio {ratio}");
        let budget = Self {
            tok_p_loss: 0,
            tok_p_action,
            tok_p_obs: (tok_p_action as f64 * ratio).floor() as usize,
        };
        ensure_config!(
            2 * budget.tok_p_action + budget.tok_p_obs <= ctx,
            "action/observation widths overflow the context window ({ctx})"
        );
        Ok(budget)
    }

    /// Observation-only layout scoring `[prev_obs, obs]`.
    pub fn observation_only(ctx: usize) -> Result<Self> {
        ensure_config!(ctx >= 2, "context window {ctx} too small");
        Ok(Self { tok_p_loss: 0, tok_p_action: 0, tok_p_obs: ctx / 2 })
    }

    pub fn tok_p_rao(&self) -> usize {
        self.tok_p_loss + self.tok_p_action + self.tok_p_obs
    }

    pub fn width(&self, kind: SegmentKind) -> usize {
        match kind {
            SegmentKind::Loss => self.tok_p_loss,
            SegmentKind::Action => self.tok_p_action,
            SegmentKind::Observation => self.tok_p_obs,
        }
    }
}

fn check_ratio(ratio: f64) -> Result<()> {
    ensure_config!(
        ratio.is_finite() && ratio >= 0.0,
        "obs_to_action_ratio must be finite and >= 0, got {ratio}"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Prefixes
// ---------------------------------------------------------------------------

/// A kind's label, tokenized once and broadcast over the batch.
#[derive(Clone, Debug)]
pub struct Prefix {
    pub kind: SegmentKind,
    pub ids: Vec<u32>,
    /// (batch, ids.len())
    pub tensor: Tensor,
}

impl Prefix {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Budget plus prefixes: everything needed to lay out fixed-width segments.
#[derive(Clone, Debug)]
pub struct SegmentPlan {
    pub budget: TokenBudget,
    pub batch_size: usize,
    loss: Option<Prefix>,
    action: Option<Prefix>,
    observation: Prefix,
}

impl SegmentPlan {
    pub fn build(
        budget: TokenBudget,
        tokenizer: &dyn TextTokenizer,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        ensure_config!(batch_size >= 1, "batch_size must be at least 1");
        ensure_config!(budget.tok_p_obs >= 1, "observation width is zero");
        let make = |kind: SegmentKind| -> Result<Option<Prefix>> {
            let width = budget.width(kind);
            if width == 0 {
                return Ok(None);
            }
            let ids = tokenizer.encode(kind.label())?;
            ensure_config!(
                ids.len() <= width,
                "{} prefix is {} tokens but the segment is only {width} wide",
                kind.name(),
                ids.len()
            );
            let row = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
            let tensor = row.repeat((batch_size, 1))?;
            Ok(Some(Prefix { kind, ids, tensor }))
        };
        let loss = make(SegmentKind::Loss)?;
        let action = make(SegmentKind::Action)?;
        let observation = make(SegmentKind::Observation)?.context("observation prefix")?;
        let plan = Self { budget, batch_size, loss, action, observation };
        tracing::info!(
            "[BUDGET] loss={} action={} obs={} rao={} (pure: {}/{}/{})",
            budget.tok_p_loss,
            budget.tok_p_action,
            budget.tok_p_obs,
            budget.tok_p_rao(),
            plan.pure_width(SegmentKind::Loss),
            plan.pure_width(SegmentKind::Action),
            plan.pure_width(SegmentKind::Observation),
        );
        Ok(plan)
    }

    pub fn width(&self, kind: SegmentKind) -> usize {
        self.budget.width(kind)
    }

    /// Content width after the label; zero when the kind is absent.
    pub fn pure_width(&self, kind: SegmentKind) -> usize {
        match self.get(kind) {
            Some(p) => self.width(kind) - p.len(),
            None => 0,
        }
    }

    pub fn get(&self, kind: SegmentKind) -> Option<&Prefix> {
        match kind {
            SegmentKind::Loss => self.loss.as_ref(),
            SegmentKind::Action => self.action.as_ref(),
            SegmentKind::Observation => Some(&self.observation),
        }
    }

    /// Prefix for a kind that must be present in this mode.
    pub fn prefix(&self, kind: SegmentKind) -> Result<&Prefix> {
        match self.get(kind) {
            Some(p) => Ok(p),
            None => Err(crate::error::RaoError::config(format!(
                "{} segments are not part of this training mode",
                kind.name()
            ))
            .into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-width fitting
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadSide {
    Left,
    Right,
}

/// Truncate (keeping the head) or pad `ids` to exactly `width` tokens.
pub fn fit_to_width(ids: &[u32], width: usize, pad: u32, side: PadSide) -> Vec<u32> {
    if ids.len() >= width {
        return ids[..width].to_vec();
    }
    let fill = width - ids.len();
    match side {
        PadSide::Right => {
            let mut out = ids.to_vec();
            out.resize(width, pad);
            out
        }
        PadSide::Left => {
            let mut out = vec![pad; fill];
            out.extend_from_slice(ids);
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
