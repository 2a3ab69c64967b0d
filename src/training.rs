use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Cosine LR Scheduler with Linear Warmup
// ---------------------------------------------------------------------------

pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, min_lr, warmup_steps, total_steps, current_step: 0 }
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            self.base_lr * (self.current_step as f64 + 1.0) / self.warmup_steps as f64
        } else {
            let progress = (self.current_step - self.warmup_steps) as f64
                / (self.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
            let progress = progress.min(1.0);
            self.min_lr
                + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
        }
    }
}

// ---------------------------------------------------------------------------
// Optimizer Config
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adamw,
    Sgd,
}

impl OptimizerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Adamw => "adamw",
            Self::Sgd => "sgd",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    /// Fraction of `total_steps` spent warming up. 0 disables the schedule warmup.
    pub warmup_fraction: f64,
    pub total_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adamw,
            lr: 1e-4,
            min_lr: 1e-5,
            weight_decay: 0.01,
            warmup_fraction: 0.0,
            total_steps: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// WeightUpdater
// ---------------------------------------------------------------------------

enum Opt {
    Adamw(AdamW),
    Sgd(SGD),
}

/// One optimizer over an explicit parameter list, plus the LR schedule.
pub struct WeightUpdater {
    optimizer: Opt,
    scheduler: CosineScheduler,
    step_count: usize,
}

impl WeightUpdater {
    pub fn new(vars: Vec<Var>, config: &TrainingConfig) -> Result<Self> {
        let warmup_steps = (config.total_steps as f64 * config.warmup_fraction) as usize;
        let scheduler =
            CosineScheduler::new(config.lr, config.min_lr, warmup_steps, config.total_steps);
        let lr = scheduler.get_lr();
        let optimizer = match config.optimizer {
            OptimizerKind::Adamw => Opt::Adamw(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: config.weight_decay,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: 1e-8,
                },
            )?),
            OptimizerKind::Sgd => Opt::Sgd(SGD::new(vars, lr)?),
        };
        Ok(Self { optimizer, scheduler, step_count: 0 })
    }

    /// Backprop `loss`, apply one update, advance the schedule.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        match &mut self.optimizer {
            Opt::Adamw(o) => o.backward_step(loss)?,
            Opt::Sgd(o) => o.backward_step(loss)?,
        }
        self.step_count += 1;
        let new_lr = self.scheduler.step();
        match &mut self.optimizer {
            Opt::Adamw(o) => o.set_learning_rate(new_lr),
            Opt::Sgd(o) => o.set_learning_rate(new_lr),
        }
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

// ---------------------------------------------------------------------------
// Model Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> Result<()> {
    let data = varmap.data().lock().map_err(|_| anyhow!("varmap lock poisoned"))?;
    let named: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    tracing::info!("[CHECKPOINT] Saved {} params to {}", named.len(), path.display());
    Ok(())
}

pub fn load_checkpoint(varmap: &VarMap, path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved) = tensors.get(name) {
            var.set(saved)?;
            loaded += 1;
        }
    }
    tracing::info!("[CHECKPOINT] Loaded {loaded}/{} params from {}", data.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn one_var() -> Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get(
            (4, 4),
            "w",
            candle_nn::Init::Randn { mean: 0.0, stdev: 0.01 },
            DType::F32,
            &Device::Cpu,
        )?;
        Ok(varmap)
    }

    #[test]
    fn test_cosine_scheduler_warmup() {
        let mut sched = CosineScheduler::new(1e-3, 1e-5, 10, 100);
        let lr0 = sched.step();
        for _ in 0..4 {
            sched.step();
        }
        let lr5 = sched.step();
        assert!(lr5 > lr0, "LR should increase during warmup: {lr0} -> {lr5}");
    }

    #[test]
    fn test_cosine_scheduler_bounds() {
        let mut sched = CosineScheduler::new(1e-3, 1e-5, 10, 100);
        for _ in 0..200 {
            let lr = sched.step();
            assert!(lr >= 1e-5 - 1e-10, "LR below min: {lr}");
            assert!(lr <= 1e-3 + 1e-10, "LR above max: {lr}");
        }
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let sched = CosineScheduler::new(1e-3, 1e-5, 0, 100);
        assert!((sched.get_lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_updater_moves_weights() -> Result<()> {
        for kind in [OptimizerKind::Adamw, OptimizerKind::Sgd] {
            let varmap = one_var()?;
            let config = TrainingConfig { optimizer: kind, lr: 1e-2, ..Default::default() };
            let mut updater = WeightUpdater::new(varmap.all_vars(), &config)?;
            let var = varmap.all_vars().remove(0);
            let before = var.as_tensor().sum_all()?.to_scalar::<f32>()?;
            let loss = var.as_tensor().sum_all()?;
            assert_eq!(updater.backward_step(&loss)?, 1);
            let after = var.as_tensor().sum_all()?.to_scalar::<f32>()?;
            assert!(after < before, "{}: {before} -> {after}", kind.name());
        }
        Ok(())
    }

    #[test]
    fn test_checkpoint_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("w.safetensors");
        let a = one_var()?;
        let b = one_var()?;
        save_checkpoint(&a, &path)?;
        load_checkpoint(&b, &path, &Device::Cpu)?;
        let ta = a.all_vars()[0].as_tensor().to_vec2::<f32>()?;
        let tb = b.all_vars()[0].as_tensor().to_vec2::<f32>()?;
        assert_eq!(ta, tb);
        Ok(())
    }
}
