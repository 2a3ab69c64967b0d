// raotrain binary.
//
// Commands:
//   raotrain train    [--config FILE | --tier test|default]   Train per the configured mode
//   raotrain budget   [--config FILE | --tier test|default]   Print the derived token widths
//   raotrain evaluate --trajectory FILE [...]                 Re-score a saved trajectory
//   raotrain helpful  --trajectory FILE --provider CMD [...]  Measure external helpful messages
//
// Rank comes from the RANK environment variable (default 0). GPU is used when
// compiled with --features cuda and the tier is not "test".

use anyhow::Context;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use raotrain::config::{ConfigTier, InitialConfig, RunConfig};
use raotrain::external::CommandProvider;
use raotrain::pipeline::{build_model, evaluate_trajectory, run_training, score_helpful_messages};
use raotrain::tokenizer::TextTokenizer;

#[derive(Parser)]
#[command(name = "raotrain", about = "Reward/action/observation training harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON run configuration. Takes precedence over --tier.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Built-in configuration tier (test or default).
    #[arg(long, default_value = "test", value_parser = clap::value_parser!(ConfigTier))]
    tier: ConfigTier,
}

#[derive(Subcommand)]
enum Command {
    Train {
        #[command(flatten)]
        cfg: ConfigArgs,
    },
    Budget {
        #[command(flatten)]
        cfg: ConfigArgs,
    },
    Evaluate {
        #[command(flatten)]
        cfg: ConfigArgs,
        /// Trajectory JSON written by a training run.
        #[arg(long)]
        trajectory: PathBuf,
        /// Only the first N steps.
        #[arg(long)]
        n_max: Option<usize>,
        /// Every N-th step.
        #[arg(long, default_value_t = 1)]
        n_step: usize,
        /// Write the series as JSON here instead of logging them.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Helpful {
        #[command(flatten)]
        cfg: ConfigArgs,
        /// Trajectory JSON written by a training run.
        #[arg(long)]
        trajectory: PathBuf,
        /// Command that reads the prompts on stdin and prints a message.
        #[arg(long)]
        provider: String,
        /// Message width in tokens.
        #[arg(long, default_value_t = 32)]
        width: usize,
        /// Only the first N steps.
        #[arg(long)]
        n_max: Option<usize>,
        /// Write the per-step deltas as JSON here.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// CUDA when requested and available, else CPU.
fn select_device(cpu_only: bool) -> Device {
    if cpu_only {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    tracing::info!("[RAO] Using CUDA device 0");
                    return dev;
                }
                Err(e) => tracing::warn!("[RAO] CUDA init failed, falling back to CPU: {e}"),
            }
        } else {
            tracing::info!("[RAO] CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        tracing::info!("[RAO] Built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");
    }

    Device::Cpu
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<(InitialConfig, bool)> {
    let (mut init, cpu_only) = match &args.config {
        Some(path) => (InitialConfig::from_file(path)?, false),
        None => (args.tier.initial_config(), args.tier == ConfigTier::Test),
    };
    if let Ok(rank) = std::env::var("RANK") {
        init.rank = rank.parse().with_context(|| format!("RANK={rank} is not a number"))?;
    }
    Ok((init, cpu_only))
}

fn derive(args: &ConfigArgs) -> anyhow::Result<(RunConfig, Rc<dyn TextTokenizer>)> {
    let (init, cpu_only) = load_config(args)?;
    let tokenizer: Rc<dyn TextTokenizer> = Rc::from(init.tokenizer.load()?);
    let run = RunConfig::derive(init, &*tokenizer, select_device(cpu_only))?;
    Ok((run, tokenizer))
}

fn cmd_train(args: &ConfigArgs) -> anyhow::Result<()> {
    let (run, tokenizer) = derive(args)?;
    tracing::info!(
        "[RAO] {} | mode={} | batch={} | batches={}",
        run.run_name,
        run.init.mode.name(),
        run.init.batch_size,
        run.init.num_batches
    );
    let summary = run_training(&run, tokenizer)?;
    match summary.losses.last() {
        Some(last) => tracing::info!("[RAO] Training complete. Final aggregate loss: {last:.4}"),
        None => tracing::info!("[RAO] Training complete. No batch was scored."),
    }
    Ok(())
}

fn cmd_budget(args: &ConfigArgs) -> anyhow::Result<()> {
    let (run, _) = derive(args)?;
    let b = run.budget();
    println!("context       {}", run.ctx);
    println!("tok_p_loss    {}", b.tok_p_loss);
    println!("tok_p_action  {}", b.tok_p_action);
    println!("tok_p_obs     {}", b.tok_p_obs);
    println!("tok_p_rao     {}", b.tok_p_rao());
    println!("run name      {}", run.run_name);
    Ok(())
}

fn cmd_evaluate(
    args: &ConfigArgs,
    trajectory: &Path,
    n_max: Option<usize>,
    n_step: usize,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let (run, tokenizer) = derive(args)?;
    let model = build_model(&run)?;
    let results = evaluate_trajectory(&model, &*tokenizer, trajectory, n_max, n_step, &run.device)?;
    match out {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&results)?)
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!("[RAO] Wrote evaluation to {}", path.display());
        }
        None => {
            for series in &results.series {
                let mean = series.points.iter().map(|(_, l)| l).sum::<f32>() / series.points.len().max(1) as f32;
                tracing::info!("[RAO] {:<10} {} points, mean loss {mean:.4}", series.name, series.points.len());
            }
        }
    }
    Ok(())
}

fn cmd_helpful(
    args: &ConfigArgs,
    trajectory: &Path,
    provider: &str,
    width: usize,
    n_max: Option<usize>,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let (run, tokenizer) = derive(args)?;
    let model = build_model(&run)?;
    let provider = CommandProvider::parse(provider)?;
    let scores = score_helpful_messages(&model, &*tokenizer, &provider, trajectory, width, n_max, &run.device)?;
    if let Some(path) = out {
        std::fs::write(path, serde_json::to_string_pretty(&scores)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    let mean = scores.iter().map(|(_, d)| d.improvement()).sum::<f32>() / scores.len().max(1) as f32;
    tracing::info!("[RAO] {} messages, mean loss improvement {mean:.4}", scores.len());
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Train { cfg } => cmd_train(cfg),
        Command::Budget { cfg } => cmd_budget(cfg),
        Command::Evaluate { cfg, trajectory, n_max, n_step, out } => {
            cmd_evaluate(cfg, trajectory, *n_max, *n_step, out.as_deref())
        }
        Command::Helpful { cfg, trajectory, provider, width, n_max, out } => {
            cmd_helpful(cfg, trajectory, provider, *width, *n_max, out.as_deref())
        }
    };

    if let Err(e) = result {
        eprintln!("[RAO] Error: {:#}", e);
        std::process::exit(1);
    }
}
