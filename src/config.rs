// Run configuration.
//
// `InitialConfig` holds the human-facing knobs (JSON file or a built-in tier).
// `RunConfig::derive` validates them, resolves the token budget and prefixes,
// and fixes output paths. Nothing is changed after that.

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::budget::{SegmentKind, SegmentPlan, TokenBudget};
use crate::dataset::{ArithmeticTask, DatasetSpec, TaskSpec};
use crate::error::{ensure_config, RaoError};
use crate::model::TrainScope;
use crate::perturb::PerturbationConfig;
use crate::sampler::SamplingConfig;
use crate::tokenizer::{ByteTokenizer, HfTokenizer, TextTokenizer};
use crate::training::{OptimizerKind, TrainingConfig};
use crate::transformer::TransformerConfig;

// ---------------------------------------------------------------------------
// Initial config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerSpec {
    Bytes,
    /// A `tokenizer.json` file.
    File { path: PathBuf },
}

impl TokenizerSpec {
    pub fn load(&self) -> Result<Box<dyn TextTokenizer>> {
        Ok(match self {
            Self::Bytes => Box::new(ByteTokenizer),
            Self::File { path } => Box::new(HfTokenizer::from_file(path)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub transformer: TransformerConfig,
    /// Directory written by a previous run's checkpoint.
    #[serde(default)]
    pub load_from: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingMode {
    /// Score each observation given the previous one. No actions.
    ObservationOnly,
    /// One action between consecutive observations, trained with the
    /// clipped policy objective.
    ActionObservation,
    /// Many Loss/Action/Observation triples per context window.
    Rao {
        num_rao: usize,
        obs_between_weight_updates: usize,
        tok_p_loss: usize,
        #[serde(default)]
        use_loss_difference: bool,
    },
}

impl TrainingMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ObservationOnly => "observation_only",
            Self::ActionObservation => "action_observation",
            Self::Rao { .. } => "rao",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebugMode {
    RepeatNPoints { num_points: usize },
    RepeatPointNTimes { num_times: usize },
    ReplaceWithRandomTokens,
    NoWeightUpdates,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryFormat {
    #[default]
    Json,
    Sqlite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialConfig {
    pub model: ModelSpec,
    pub tokenizer: TokenizerSpec,
    pub training: TrainingConfig,
    #[serde(default = "default_scope")]
    pub train_scope: TrainScope,
    pub batch_size: usize,
    pub num_batches: usize,
    pub obs_to_action_ratio: f64,
    pub interval_save_weights: usize,
    pub interval_print: usize,
    /// Defaults to the model's maximum positions.
    #[serde(default)]
    pub training_ctxt_size: Option<usize>,
    pub dataset: DatasetSpec,
    pub mode: TrainingMode,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub perturbation: Option<PerturbationConfig>,
    #[serde(default)]
    pub debug: Option<DebugMode>,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub trajectory_format: TrajectoryFormat,
    #[serde(default)]
    pub rank: usize,
}

fn default_scope() -> TrainScope {
    TrainScope::Full
}

impl InitialConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn ctx(&self) -> usize {
        self.training_ctxt_size.unwrap_or(self.model.transformer.max_seq_len)
    }
}

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigTier {
    Test,
    Default,
}

impl std::str::FromStr for ConfigTier {
    type Err = RaoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "test" => Ok(Self::Test),
            "default" => Ok(Self::Default),
            _ => Err(RaoError::config(format!("unknown config tier '{s}'"))),
        }
    }
}

impl ConfigTier {

    pub fn initial_config(self) -> InitialConfig {
        match self {
            Self::Test => InitialConfig {
                model: ModelSpec {
                    name: "tiny".into(),
                    transformer: TransformerConfig::tiny(),
                    load_from: None,
                },
                tokenizer: TokenizerSpec::Bytes,
                training: TrainingConfig {
                    optimizer: OptimizerKind::Sgd,
                    lr: 1e-3,
                    total_steps: 8,
                    ..Default::default()
                },
                train_scope: TrainScope::Full,
                batch_size: 2,
                num_batches: 6,
                obs_to_action_ratio: 2.0,
                interval_save_weights: 3,
                interval_print: 1,
                training_ctxt_size: None,
                dataset: DatasetSpec {
                    task: TaskSpec::Arithmetic(ArithmeticTask {
                        num_digits: 1,
                        num_terms: 2,
                        operations: None,
                        probs: None,
                        seed: Some(0),
                    }),
                    peek_every: None,
                },
                mode: TrainingMode::ActionObservation,
                sampling: SamplingConfig { temperature: 1.0, num_return_sequences: 1 },
                perturbation: None,
                debug: None,
                save_dir: PathBuf::from("saved_weights_and_losses"),
                trajectory_format: TrajectoryFormat::Json,
                rank: 0,
            },
            Self::Default => InitialConfig {
                model: ModelSpec {
                    name: "small".into(),
                    transformer: TransformerConfig::small(),
                    load_from: None,
                },
                tokenizer: TokenizerSpec::Bytes,
                training: TrainingConfig { total_steps: 1000, warmup_fraction: 0.05, ..Default::default() },
                train_scope: TrainScope::HeadsOnly,
                batch_size: 4,
                num_batches: 1000,
                obs_to_action_ratio: 2.0,
                interval_save_weights: 100,
                interval_print: 10,
                training_ctxt_size: None,
                dataset: DatasetSpec {
                    task: TaskSpec::Arithmetic(ArithmeticTask {
                        num_digits: 2,
                        num_terms: 6,
                        operations: Some(vec!["+".into(), "-".into(), "*".into()]),
                        probs: Some(vec![0.5, 0.25, 0.25]),
                        seed: None,
                    }),
                    peek_every: None,
                },
                mode: TrainingMode::ActionObservation,
                sampling: SamplingConfig { temperature: 1.0, num_return_sequences: 1 },
                perturbation: Some(PerturbationConfig {
                    eval_every: 10,
                    frac_of_tokens_to_randomize: 0.5,
                    frac_of_tokens_to_pad: 0.0,
                    p_digit_change: 0.0,
                }),
                debug: None,
                save_dir: PathBuf::from("saved_weights_and_losses"),
                trajectory_format: TrajectoryFormat::Json,
                rank: 0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Derived config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RunPaths {
    pub log: PathBuf,
    pub metrics: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
    /// Trajectory file name without the timestamp suffix.
    pub trajectory_base: String,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub init: InitialConfig,
    pub ctx: usize,
    pub plan: SegmentPlan,
    pub device: Device,
    pub run_name: String,
    pub paths: RunPaths,
}

impl RunConfig {
    pub fn derive(init: InitialConfig, tokenizer: &dyn TextTokenizer, device: Device) -> Result<Self> {
        let model = &init.model.transformer;
        let ctx = init.ctx();
        ensure_config!(init.batch_size >= 1, "batch_size must be at least 1");
        ensure_config!(init.num_batches >= 1, "num_batches must be at least 1");
        ensure_config!(init.interval_save_weights >= 1, "interval_save_weights must be at least 1");
        ensure_config!(init.interval_print >= 1, "interval_print must be at least 1");
        ensure_config!(
            init.obs_to_action_ratio.is_finite() && init.obs_to_action_ratio > 0.0,
            "obs_to_action_ratio must be positive, got {}",
            init.obs_to_action_ratio
        );
        ensure_config!(
            ctx <= model.max_seq_len,
            "training_ctxt_size {ctx} exceeds the model's {} positions",
            model.max_seq_len
        );
        ensure_config!(
            tokenizer.vocab_size() <= model.vocab_size,
            "tokenizer has {} ids but the model only {}",
            tokenizer.vocab_size(),
            model.vocab_size
        );
        ensure_config!(
            init.sampling.num_return_sequences >= 1,
            "num_return_sequences must be at least 1"
        );
        ensure_config!(
            init.sampling.temperature.is_finite() && init.sampling.temperature >= 0.0,
            "temperature must be non-negative"
        );
        ensure_config!(init.dataset.peek_every != Some(0), "peek_every must be at least 1");
        if let Some(p) = &init.perturbation {
            p.validate()?;
        }
        ensure_config!(
            !matches!(
                init.debug,
                Some(DebugMode::RepeatNPoints { num_points: 0 })
                    | Some(DebugMode::RepeatPointNTimes { num_times: 0 })
            ),
            "debug repeat counts must be at least 1"
        );
        if let TaskSpec::Arithmetic(task) = &init.dataset.task {
            task.resolve()?;
        }

        let ratio = init.obs_to_action_ratio;
        let budget = match &init.mode {
            TrainingMode::ObservationOnly => TokenBudget::observation_only(ctx)?,
            TrainingMode::ActionObservation => {
                let budget = TokenBudget::action_observation(ctx, ratio)?;
                // [prev_action, prev_obs, action] is the longest sequence scored.
                let longest = 2 * budget.tok_p_action + budget.tok_p_obs;
                ensure_config!(
                    longest <= model.max_seq_len,
                    "action/observation widths need {longest} positions, model has {}",
                    model.max_seq_len
                );
                budget
            }
            TrainingMode::Rao { num_rao, obs_between_weight_updates, tok_p_loss, .. } => {
                ensure_config!(*num_rao >= 1, "num_rao must be at least 1");
                ensure_config!(
                    *obs_between_weight_updates >= 1,
                    "obs_between_weight_updates must be at least 1"
                );
                TokenBudget::rao(ctx, ratio, *num_rao, *tok_p_loss)?
            }
        };
        let plan = SegmentPlan::build(budget, tokenizer, init.batch_size, &device)?;
        for kind in SegmentKind::ALL {
            if plan.get(kind).is_some() {
                ensure_config!(plan.pure_width(kind) >= 1, "{} has no room after its label", kind.name());
            }
        }

        let run_name = run_name(&init, &budget);
        let dir = &init.save_dir;
        let model_name = &init.model.name;
        let paths = RunPaths {
            log: dir.join(format!("{model_name}_log.txt")),
            metrics: dir.join(format!("{run_name}metrics.jsonl")),
            weights: dir.join(format!("{model_name}_weights")),
            tokenizer: dir.join(format!("{model_name}_tokenizer")),
            trajectory_base: format!("{model_name}_traj"),
        };
        Ok(Self { init, ctx, plan, device, run_name, paths })
    }

    pub fn is_primary(&self) -> bool {
        self.init.rank == 0
    }

    pub fn budget(&self) -> TokenBudget {
        self.plan.budget
    }
}

/// Compact run identifier built from the knobs that differ between runs.
pub fn run_name(init: &InitialConfig, budget: &TokenBudget) -> String {
    let mut name = String::new();
    let short: String = init.model.name.chars().take(4).collect();
    name.push_str(&format!("{short}_"));
    if init.training.lr != 1e-4 {
        name.push_str(&format!("lr{}_", init.training.lr));
    }
    match &init.mode {
        TrainingMode::ObservationOnly => name.push_str(&format!("AR_obs{}_", budget.tok_p_obs)),
        TrainingMode::ActionObservation => name.push_str(&format!(
            "AO_ao{}-{}-{}_",
            budget.tok_p_loss, budget.tok_p_action, budget.tok_p_obs
        )),
        TrainingMode::Rao { num_rao, obs_between_weight_updates, use_loss_difference, .. } => {
            name.push_str(&format!(
                "RAO_nr{num_rao}_rao{}-{}-{}_obwu{obs_between_weight_updates}_",
                budget.tok_p_loss, budget.tok_p_action, budget.tok_p_obs
            ));
            if init.train_scope == TrainScope::HeadsOnly {
                name.push_str("heads_");
            }
            if *use_loss_difference {
                name.push_str("ld_");
            }
        }
    }
    if init.batch_size != 1 {
        name.push_str(&format!("bs{}_", init.batch_size));
    }
    name.push_str(&format!("nb{}_", init.num_batches));
    if init.obs_to_action_ratio != 1.0 {
        name.push_str(&format!("o-a={}-1_", init.obs_to_action_ratio));
    }
    if init.model.load_from.is_some() {
        name.push_str("load_");
    }
    if let Some(ctx) = init.training_ctxt_size {
        name.push_str(&format!("ics{ctx}_"));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_config_error(result: Result<RunConfig>) -> bool {
        matches!(
            result.err().and_then(|e| e.downcast::<RaoError>().ok()),
            Some(RaoError::Config(_))
        )
    }

    #[test]
    fn test_tier_parses_by_name() {
        assert_eq!("test".parse::<ConfigTier>().ok(), Some(ConfigTier::Test));
        assert_eq!("default".parse::<ConfigTier>().ok(), Some(ConfigTier::Default));
        let err = "huge".parse::<ConfigTier>().unwrap_err();
        assert!(err.to_string().contains("unknown config tier 'huge'"));
    }

    #[test]
    fn test_tiers_derive() -> Result<()> {
        for tier in [ConfigTier::Test, ConfigTier::Default] {
            let run = RunConfig::derive(tier.initial_config(), &ByteTokenizer, Device::Cpu)?;
            assert!(run.plan.pure_width(SegmentKind::Action) > 0);
            assert!(run.is_primary());
        }
        Ok(())
    }

    #[test]
    fn test_test_tier_widths() -> Result<()> {
        let run = RunConfig::derive(ConfigTier::Test.initial_config(), &ByteTokenizer, Device::Cpu)?;
        let b = run.budget();
        assert_eq!((b.tok_p_loss, b.tok_p_action, b.tok_p_obs), (0, 64, 128));
        assert_eq!(run.run_name, "tiny_lr0.001_AO_ao0-64-128_bs2_nb6_o-a=2-1_");
        assert!(run.paths.log.ends_with("tiny_log.txt"));
        Ok(())
    }

    #[test]
    fn test_rao_mode_budget() -> Result<()> {
        let mut init = ConfigTier::Test.initial_config();
        init.mode = TrainingMode::Rao {
            num_rao: 2,
            obs_between_weight_updates: 3,
            tok_p_loss: 12,
            use_loss_difference: true,
        };
        let run = RunConfig::derive(init, &ByteTokenizer, Device::Cpu)?;
        let b = run.budget();
        // floor(256 / (3 * 3) - 12 / 3) = 24
        assert_eq!((b.tok_p_loss, b.tok_p_action, b.tok_p_obs), (12, 24, 48));
        assert!(run.run_name.contains("RAO_nr2_rao12-24-48_obwu3_ld_"));
        Ok(())
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut init = ConfigTier::Test.initial_config();
        init.training_ctxt_size = Some(10_000);
        assert!(is_config_error(RunConfig::derive(init, &ByteTokenizer, Device::Cpu)));

        let mut init = ConfigTier::Test.initial_config();
        init.interval_print = 0;
        assert!(is_config_error(RunConfig::derive(init, &ByteTokenizer, Device::Cpu)));

        let mut init = ConfigTier::Test.initial_config();
        init.perturbation = Some(PerturbationConfig {
            eval_every: 1,
            frac_of_tokens_to_randomize: 2.0,
            frac_of_tokens_to_pad: 0.0,
            p_digit_change: 0.0,
        });
        assert!(is_config_error(RunConfig::derive(init, &ByteTokenizer, Device::Cpu)));

        let mut init = ConfigTier::Test.initial_config();
        init.mode = TrainingMode::Rao {
            num_rao: 1,
            obs_between_weight_updates: 1,
            tok_p_loss: 400,
            use_loss_difference: false,
        };
        assert!(is_config_error(RunConfig::derive(init, &ByteTokenizer, Device::Cpu)));
    }

    #[test]
    fn test_config_json_roundtrip() -> Result<()> {
        let init = ConfigTier::Default.initial_config();
        let json = serde_json::to_string_pretty(&init)?;
        assert!(json.contains("\"kind\": \"action_observation\""));
        let back: InitialConfig = serde_json::from_str(&json)?;
        assert_eq!(back, init);
        Ok(())
    }
}
