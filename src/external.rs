// Helpful messages from an external completion provider.
//
// A provider turns a piece of content into a short message meant to make that
// content easier to predict. The message is re-tokenized, fitted to a fixed
// width (left-padded with "-"), and judged by how much it lowers the model's
// loss on the content.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::Rng;
use serde::Serialize;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::budget::{fit_to_width, PadSide};
use crate::error::RaoError;
use crate::loss::neg_log_probs;
use crate::model::CausalLm;
use crate::tokenizer::TextTokenizer;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a language model's assistant, and your job is to prepend text that makes the following text as predictable as possible. Do not be afraid to copy surprising parts of the text verbatim.";
pub const DEFAULT_USER_PROMPT: &str = "Please generate a prepend string for the following text: ";

pub trait CompletionProvider {
    /// Provider failures worth retrying should surface as `RaoError::Transient`.
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Runs a local command per request. The system prompt, a blank line and the
/// user prompt go to stdin; trimmed stdout is the message. A non-zero exit is
/// reported as transient.
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    /// Split on whitespace: program first, then arguments.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().context("empty provider command")?;
        Ok(Self { program, args: parts.collect() })
    }
}

impl CompletionProvider for CommandProvider {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("starting provider '{}'", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A provider may exit without reading its input.
            match write!(stdin, "{system_prompt}\n\n{user_prompt}") {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RaoError::Transient(format!(
                "provider '{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(10) }
    }
}

impl RetryPolicy {
    /// Uniform in [0, min(base * 2^attempt, max)].
    fn delay(&self, attempt: usize, rng: &mut impl Rng) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(31) as u32);
        let ceiling = self.base_delay.saturating_mul(exp).min(self.max_delay);
        ceiling.mul_f64(rng.gen::<f64>())
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RaoError>().is_some_and(RaoError::is_transient)
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is used up. `op` receives the zero-based attempt number.
pub fn retry_with_backoff<T>(policy: &RetryPolicy, mut op: impl FnMut(usize) -> Result<T>) -> Result<T> {
    let mut rng = rand::thread_rng();
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < policy.max_attempts => {
                let wait = policy.delay(attempt, &mut rng);
                tracing::warn!("[EXTERNAL] attempt {} failed ({e}), retrying in {wait:?}", attempt + 1);
                std::thread::sleep(wait);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The id of "-", used to left-pad short messages.
pub fn dash_id(tokenizer: &dyn TextTokenizer) -> Result<u32> {
    tokenizer
        .encode("-")?
        .first()
        .copied()
        .context("tokenizer produced no id for \"-\"")
}

/// Truncate to `width` keeping the head, or left-pad with `dash`.
pub fn fit_helpful_message(ids: &[u32], width: usize, dash: u32) -> Vec<u32> {
    fit_to_width(ids, width, dash, PadSide::Left)
}

pub struct HelpfulMessenger<'a> {
    provider: &'a dyn CompletionProvider,
    tokenizer: &'a dyn TextTokenizer,
    width: usize,
    retry: RetryPolicy,
    system_prompt: String,
    user_prompt: String,
}

impl<'a> HelpfulMessenger<'a> {
    pub fn new(provider: &'a dyn CompletionProvider, tokenizer: &'a dyn TextTokenizer, width: usize) -> Self {
        Self {
            provider,
            tokenizer,
            width,
            retry: RetryPolicy::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_prompt: DEFAULT_USER_PROMPT.to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prompts(mut self, system: &str, user: &str) -> Self {
        self.system_prompt = system.to_string();
        self.user_prompt = user.to_string();
        self
    }

    /// A (1, width) message for the first row of `content`.
    pub fn message_for(&self, content: &Tensor) -> Result<Tensor> {
        let text = self.tokenizer.decode(&content.get(0)?.to_vec1::<u32>()?)?;
        let user = format!("{}{text}", self.user_prompt);
        let reply = retry_with_backoff(&self.retry, |_| self.provider.complete(&self.system_prompt, &user))?;
        tracing::debug!("[EXTERNAL] message: {reply:?}");
        let ids = fit_helpful_message(&self.tokenizer.encode(&reply)?, self.width, dash_id(self.tokenizer)?);
        Tensor::from_vec(ids, (1, self.width), content.device()).map_err(Into::into)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LossDelta {
    pub without_message: f32,
    pub with_message: f32,
}

impl LossDelta {
    /// Positive when the message helps.
    pub fn improvement(&self) -> f32 {
        self.without_message - self.with_message
    }
}

/// Mean NLL of `content[1..]` with and without `message` prepended. Both
/// score the same target tokens.
pub fn message_loss_delta(model: &dyn CausalLm, content: &Tensor, message: &Tensor) -> Result<LossDelta> {
    let msg_len = message.dim(1)?;
    let content_len = content.dim(1)?;
    let mean = |t: Tensor| -> Result<f32> { Ok(t.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?) };

    let without = neg_log_probs(model, content, true)?.detach();
    let joined = Tensor::cat(&[message, content], 1)?;
    let with = neg_log_probs(model, &joined, true)?
        .detach()
        .narrow(1, msg_len, content_len - 1)?;
    Ok(LossDelta { without_message: mean(without)?, with_message: mean(with)? })
}
