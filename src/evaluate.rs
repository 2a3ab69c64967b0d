// Re-score the actions of a saved trajectory.
//
// For every sampled step the stored observation loss ("Training") is compared
// with the current model's loss given the stored action ("Pure") and given
// perturbed copies of it, one series per named perturbation.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::Serialize;

use crate::budget::SegmentKind;
use crate::loss::predict_observation;
use crate::model::CausalLm;
use crate::perturb::{ActionPerturber, PerturbationConfig};
use crate::tokenizer::TextTokenizer;
use crate::trajectory::TrajectoryDocument;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    /// (trajectory step, loss)
    pub points: Vec<(usize, f32)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvaluationResults {
    pub model: String,
    pub series: Vec<Series>,
}

impl EvaluationResults {
    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.name == name)
    }
}

pub struct ActionEvaluator<'a> {
    model: &'a dyn CausalLm,
    tokenizer: &'a dyn TextTokenizer,
    perturbations: Vec<(String, PerturbationConfig)>,
    n_max: Option<usize>,
    n_step: usize,
}

impl<'a> ActionEvaluator<'a> {
    pub fn new(model: &'a dyn CausalLm, tokenizer: &'a dyn TextTokenizer) -> Self {
        Self { model, tokenizer, perturbations: PerturbationConfig::evaluation_set(), n_max: None, n_step: 1 }
    }

    pub fn with_perturbations(mut self, perturbations: Vec<(String, PerturbationConfig)>) -> Self {
        self.perturbations = perturbations;
        self
    }

    /// Only steps below `n_max` whose index is a multiple of `n_step`.
    pub fn with_limits(mut self, n_max: Option<usize>, n_step: usize) -> Self {
        self.n_max = n_max;
        self.n_step = n_step.max(1);
        self
    }

    fn loss(&self, action: &Tensor, obs: &Tensor) -> Result<f32> {
        let loss = predict_observation(self.model, action, obs, true)?;
        Ok(loss.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    fn row(&self, text: &str, device: &Device) -> Result<Tensor> {
        let ids = self.tokenizer.encode(text)?;
        let n = ids.len();
        Ok(Tensor::from_vec(ids, (1, n), device)?)
    }

    pub fn evaluate(&self, doc: &TrajectoryDocument, device: &Device, rng: &mut impl Rng) -> Result<EvaluationResults> {
        for (_, p) in &self.perturbations {
            p.validate()?;
        }
        let label = self.tokenizer.encode(SegmentKind::Action.label())?.len();
        let perturber = ActionPerturber::new(self.tokenizer, label);
        let n_max = self.n_max.unwrap_or(doc.trajectory.len());

        let mut training = Vec::new();
        let mut pure = Vec::new();
        let mut perturbed: Vec<Vec<(usize, f32)>> = vec![Vec::new(); self.perturbations.len()];

        for (i, step) in doc.trajectory.iter().enumerate().take(n_max).step_by(self.n_step) {
            let action = self.row(&step.action, device)?;
            let obs = self.row(&step.obs, device)?;
            if obs.dim(1)? == 0 || action.dim(1)? == 0 {
                tracing::warn!("[EVAL] step {i}: empty action or observation, skipped");
                continue;
            }
            let needed = action.dim(1)? + obs.dim(1)?;
            ensure!(
                needed <= self.model.max_positions(),
                "step {i}: {needed} tokens exceed the model's {} positions",
                self.model.max_positions()
            );

            training.push((i, step.observation_loss));
            pure.push((i, self.loss(&action, &obs)?));
            for ((_, cfg), series) in self.perturbations.iter().zip(perturbed.iter_mut()) {
                let changed = perturber.perturb(&action, cfg, rng)?;
                series.push((i, self.loss(&changed, &obs)?));
            }
        }

        let mut series = vec![
            Series { name: "Training".into(), points: training },
            Series { name: "Pure".into(), points: pure },
        ];
        for ((name, _), points) in self.perturbations.iter().zip(perturbed) {
            series.push(Series { name: name.clone(), points });
        }
        tracing::info!("[EVAL] scored {} steps of {}", series[0].points.len(), doc.metadata.model);
        Ok(EvaluationResults { model: doc.metadata.model.clone(), series })
    }
}
