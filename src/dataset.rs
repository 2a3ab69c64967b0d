// Datasets: synthetic arithmetic, question/answer JSONL and raw text, all
// turned into lazy streams of batched datapoints.
//
//   arithmetic / qa file -> two-step trajectories -> interleaved across slots
//                        -> tokenized + padded -> Datapoint
//   text                 -> token chunks -> SequencePacker -> prefixed blocks
//                        -> Datapoint
//
// Then: random-token replacement, peek_every, debug repeats, pairs, take.

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::assemble::prefixed_row;
use crate::budget::{SegmentKind, SegmentPlan};
use crate::config::{DebugMode, RunConfig};
use crate::error::ensure_config;
use crate::packer::{DocumentGrouper, PrefixedBlocks, SequencePacker};
use crate::tokenizer::TextTokenizer;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One batched step of data. `first` marks the start of new trajectories.
#[derive(Clone, Debug)]
pub struct Datapoint {
    /// (batch, tok_p_obs)
    pub observation: Tensor,
    /// (batch, tok_p_action), ground truth when present
    pub action: Option<Tensor>,
    pub first: bool,
}

pub type DatapointStream = Box<dyn Iterator<Item = Result<Datapoint>>>;
pub type PairStream = Box<dyn Iterator<Item = Result<(Datapoint, Datapoint)>>>;
pub type DocumentStream = Box<dyn Iterator<Item = Result<Tensor>>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub task: TaskSpec,
    /// Keep ground-truth actions only on every n-th datapoint that has one.
    /// `None` drops ground-truth actions entirely.
    #[serde(default)]
    pub peek_every: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Arithmetic(ArithmeticTask),
    /// JSONL of `{"question", "answer", "explanation"?}`.
    QaFile { path: PathBuf },
    /// Plain text lines, or JSONL with a `text` field.
    Text { path: PathBuf },
}

// ---------------------------------------------------------------------------
// Arithmetic generator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticTask {
    pub num_digits: u32,
    pub num_terms: usize,
    /// Subset of "+", "-", "*". Defaults to addition only.
    #[serde(default)]
    pub operations: Option<Vec<String>>,
    /// One probability per operation. Defaults to uniform.
    #[serde(default)]
    pub probs: Option<Vec<f64>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "+" => Some(Self::Add),
            "-" => Some(Self::Sub),
            "*" => Some(Self::Mul),
            _ => None,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
        }
    }

    fn apply(self, a: i128, b: i128) -> i128 {
        match self {
            Self::Add => a.saturating_add(b),
            Self::Sub => a.saturating_sub(b),
            Self::Mul => a.saturating_mul(b),
        }
    }
}

impl ArithmeticTask {
    /// Validated operations and their sampling weights.
    pub fn resolve(&self) -> Result<(Vec<ArithOp>, Vec<f64>)> {
        ensure_config!(self.num_terms >= 1, "num_terms must be at least 1");
        ensure_config!(
            (1..=9).contains(&self.num_digits),
            "num_digits must be in 1..=9, got {}",
            self.num_digits
        );
        let names = self.operations.clone().unwrap_or_else(|| vec!["+".to_string()]);
        ensure_config!(!names.is_empty(), "operations must not be empty");
        let mut ops = Vec::with_capacity(names.len());
        for name in &names {
            let op = ArithOp::parse(name);
            ensure_config!(op.is_some(), "invalid operation {name:?}, expected one of + - *");
            ops.extend(op);
        }
        let probs = self
            .probs
            .clone()
            .unwrap_or_else(|| vec![1.0 / ops.len() as f64; ops.len()]);
        ensure_config!(
            probs.len() == ops.len(),
            "len(operations)={} != len(probs)={}",
            ops.len(),
            probs.len()
        );
        ensure_config!(
            probs.iter().all(|p| p.is_finite() && *p >= 0.0),
            "probabilities must be finite and non-negative"
        );
        let total: f64 = probs.iter().sum();
        ensure_config!((total - 1.0).abs() < 1e-6, "probabilities sum to {total}, expected 1");
        Ok((ops, probs))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// Endless `Question: a + b.` / `Answer: n` pairs, evaluated left to right.
pub struct ArithmeticGenerator {
    num_terms: usize,
    max_value: u64,
    ops: Vec<ArithOp>,
    choose: WeightedIndex<f64>,
    rng: StdRng,
}

impl ArithmeticGenerator {
    pub fn new(task: &ArithmeticTask) -> Result<Self> {
        let (ops, probs) = task.resolve()?;
        let rng = match task.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            num_terms: task.num_terms,
            max_value: 10u64.pow(task.num_digits) - 1,
            ops,
            choose: WeightedIndex::new(&probs).context("operation weights")?,
            rng,
        })
    }
}

impl Iterator for ArithmeticGenerator {
    type Item = QaPair;

    fn next(&mut self) -> Option<QaPair> {
        let mut question = String::from("Question:");
        let mut total = 0i128;
        for i in 0..self.num_terms {
            // exclusive bound: 10^d - 1 itself is never drawn
            let num = self.rng.gen_range(0..self.max_value.max(1)) as i128;
            if i == 0 {
                total = num;
                question.push_str(&format!(" {num}"));
            } else {
                let op = self.ops[self.choose.sample(&mut self.rng)];
                total = op.apply(total, num);
                question.push_str(&format!(" {} {num}", op.symbol()));
            }
        }
        question.push('.');
        Some(QaPair { question, answer: format!("Answer: {total}"), explanation: None })
    }
}

// ---------------------------------------------------------------------------
// Trajectories and slot interleaving
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct TextStep {
    pub observation: String,
    pub action: Option<String>,
    pub first: bool,
}

/// Question, then answer (with the explanation as its action when present).
pub fn to_qa_trajectory(pair: QaPair) -> Vec<TextStep> {
    vec![
        TextStep { observation: pair.question, action: None, first: true },
        TextStep { observation: pair.answer, action: pair.explanation, first: false },
    ]
}

/// Gives each batch slot its own trajectory; a slot that runs out starts the
/// next trajectory from the shared source.
pub struct SlotInterleaver<I> {
    trajectories: I,
    slots: Vec<VecDeque<TextStep>>,
}

impl<I> SlotInterleaver<I> {
    pub fn new(trajectories: I, batch_size: usize) -> Self {
        Self { trajectories, slots: vec![VecDeque::new(); batch_size] }
    }
}

impl<I> Iterator for SlotInterleaver<I>
where
    I: Iterator<Item = Result<Vec<TextStep>>>,
{
    type Item = Result<Vec<TextStep>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter_mut() {
            while slot.is_empty() {
                match self.trajectories.next()? {
                    Ok(steps) => slot.extend(steps),
                    Err(e) => return Some(Err(e)),
                }
            }
            batch.extend(slot.pop_front());
        }
        Some(Ok(batch))
    }
}

/// Tokenize one step per slot into a datapoint. Content must fit strictly
/// inside the pure width; the remainder is padded.
pub fn tokenize_and_pad(
    steps: &[TextStep],
    tokenizer: &dyn TextTokenizer,
    plan: &SegmentPlan,
    device: &Device,
) -> Result<Datapoint> {
    ensure!(!steps.is_empty(), "empty batch");
    let pad = tokenizer.pad_id();
    let encode = |text: &str, kind: SegmentKind| -> Result<Vec<u32>> {
        let pure = plan.pure_width(kind);
        let ids = tokenizer.encode(text)?;
        ensure!(
            ids.len() < pure,
            "{} of {} tokens does not fit in {pure}: {text:?}",
            kind.name(),
            ids.len()
        );
        Ok(prefixed_row(plan.prefix(kind)?, &ids, pure, pad))
    };

    let batch = steps.len();
    let mut obs = Vec::with_capacity(batch * plan.width(SegmentKind::Observation));
    for step in steps {
        obs.extend(encode(&step.observation, SegmentKind::Observation)?);
    }
    let observation = Tensor::from_vec(obs, (batch, plan.width(SegmentKind::Observation)), device)?;

    // Batches are synchronized: slot 0 decides whether actions and `first` apply.
    let action = match (&steps[0].action, plan.get(SegmentKind::Action)) {
        (None, _) | (_, None) => None,
        (Some(_), Some(_)) => {
            let mut acts = Vec::with_capacity(batch * plan.width(SegmentKind::Action));
            for step in steps {
                let text = step.action.as_deref().context("unsynchronized actions in batch")?;
                acts.extend(encode(text, SegmentKind::Action)?);
            }
            Some(Tensor::from_vec(acts, (batch, plan.width(SegmentKind::Action)), device)?)
        }
    };
    Ok(Datapoint { observation, action, first: steps[0].first })
}

// ---------------------------------------------------------------------------
// File sources
// ---------------------------------------------------------------------------

/// Non-empty lines of a file, read lazily. Lines starting with `{` are parsed
/// as JSON and their `text` field is used.
pub struct TextLines {
    lines: Lines<BufReader<File>>,
}

impl TextLines {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self { lines: BufReader::new(file).lines() })
    }
}

impl Iterator for TextLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(e.into())),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with('{') {
                return Some(Ok(line));
            }
            let parsed = serde_json::from_str::<serde_json::Value>(trimmed)
                .context("parsing JSONL record")
                .and_then(|v| {
                    v.get("text")
                        .and_then(|t| t.as_str())
                        .map(str::to_string)
                        .context("JSONL record without a text field")
                });
            return Some(parsed);
        }
    }
}

fn read_qa_pairs(path: &Path) -> Result<impl Iterator<Item = Result<QaPair>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file).lines().filter_map(|line| match line {
        Ok(l) if l.trim().is_empty() => None,
        Ok(l) => Some(serde_json::from_str::<QaPair>(&l).context("parsing QA record")),
        Err(e) => Some(Err(e.into())),
    }))
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

/// Keep ground-truth actions on every n-th datapoint that carries one.
pub fn peek_every(stream: DatapointStream, n: usize) -> DatapointStream {
    let mut seen = 0usize;
    Box::new(stream.map(move |d| {
        d.map(|mut d| {
            if d.action.is_some() {
                if seen % n != 0 {
                    d.action = None;
                }
                seen += 1;
            }
            d
        })
    }))
}

pub fn strip_actions(stream: DatapointStream) -> DatapointStream {
    Box::new(stream.map(|d| d.map(|d| Datapoint { action: None, ..d })))
}

/// Replace whole observations with uniformly random token ids.
pub fn replace_with_random_tokens(stream: DatapointStream, vocab_size: usize) -> DatapointStream {
    let mut rng = rand::thread_rng();
    Box::new(stream.map(move |d| {
        let d = d?;
        let dims = d.observation.dims2()?;
        let ids: Vec<u32> = (0..dims.0 * dims.1)
            .map(|_| rng.gen_range(0..vocab_size as u32))
            .collect();
        let observation = Tensor::from_vec(ids, dims, d.observation.device())?;
        Ok(Datapoint { observation, ..d })
    }))
}

/// Cycle forever through the first `n` items.
pub struct RepeatFirstN<I, T> {
    source: I,
    n: usize,
    cache: Vec<T>,
    index: usize,
}

impl<I, T> RepeatFirstN<I, T> {
    pub fn new(source: I, n: usize) -> Self {
        Self { source, n, cache: Vec::with_capacity(n), index: 0 }
    }
}

impl<T: Clone, I: Iterator<Item = Result<T>>> Iterator for RepeatFirstN<I, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cache.len() < self.n {
            match self.source.next() {
                Some(Ok(v)) => {
                    self.cache.push(v.clone());
                    return Some(Ok(v));
                }
                Some(Err(e)) => return Some(Err(e)),
                // fewer than n items: cycle what we have
                None if self.cache.is_empty() => return None,
                None => self.n = self.cache.len(),
            }
        }
        let out = self.cache.get(self.index)?.clone();
        self.index = (self.index + 1) % self.n;
        Some(Ok(out))
    }
}

/// Yield every item `n` times in a row.
pub struct RepeatEach<I, T> {
    source: I,
    n: usize,
    current: Option<T>,
    left: usize,
}

impl<I, T> RepeatEach<I, T> {
    pub fn new(source: I, n: usize) -> Self {
        Self { source, n, current: None, left: 0 }
    }
}

impl<T: Clone, I: Iterator<Item = Result<T>>> Iterator for RepeatEach<I, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            match self.source.next()? {
                Ok(v) => {
                    self.current = Some(v);
                    self.left = self.n;
                }
                Err(e) => return Some(Err(e)),
            }
        }
        self.left -= 1;
        self.current.clone().map(Ok)
    }
}

/// Overlapping pairs: (x0, x1), (x1, x2), ...
pub struct Pairs<I, T> {
    source: I,
    prev: Option<T>,
}

impl<I, T> Pairs<I, T> {
    pub fn new(source: I) -> Self {
        Self { source, prev: None }
    }
}

impl<T: Clone, I: Iterator<Item = Result<T>>> Iterator for Pairs<I, T> {
    type Item = Result<(T, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.prev.is_none() {
            match self.source.next()? {
                Ok(v) => self.prev = Some(v),
                Err(e) => return Some(Err(e)),
            }
        }
        let next = match self.source.next()? {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let prev = self.prev.replace(next.clone())?;
        Some(Ok((prev, next)))
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

fn qa_datapoints<I>(
    pairs: I,
    tokenizer: Rc<dyn TextTokenizer>,
    plan: SegmentPlan,
    device: Device,
) -> DatapointStream
where
    I: Iterator<Item = Result<QaPair>> + 'static,
{
    let batch = plan.batch_size;
    let trajectories = pairs.map(|p| p.map(to_qa_trajectory));
    Box::new(
        SlotInterleaver::new(trajectories, batch)
            .map(move |steps| tokenize_and_pad(&steps?, tokenizer.as_ref(), &plan, &device)),
    )
}

fn text_datapoints(
    path: &Path,
    tokenizer: Rc<dyn TextTokenizer>,
    plan: &SegmentPlan,
    device: &Device,
) -> Result<DatapointStream> {
    let tok = tokenizer.clone();
    let chunks = TextLines::open(path)?.map(move |line| tok.encode(&line?));
    let pure = plan.pure_width(SegmentKind::Observation);
    let packer = SequencePacker::new(chunks, plan.batch_size, pure, device);
    let prefix = plan.prefix(SegmentKind::Observation)?.ids.clone();
    let blocks = PrefixedBlocks::new(packer, prefix, pure);
    Ok(Box::new(blocks.map(|b| {
        b.map(|observation| Datapoint { observation, action: None, first: false })
    })))
}

/// Task-specific datapoints before peeking, debug repeats and pairing.
fn base_stream(run: &RunConfig, tokenizer: Rc<dyn TextTokenizer>) -> Result<DatapointStream> {
    let plan = run.plan.clone();
    let device = run.device.clone();
    let stream = match &run.init.dataset.task {
        TaskSpec::Arithmetic(task) => {
            let pairs = ArithmeticGenerator::new(task)?.map(Ok);
            qa_datapoints(pairs, tokenizer.clone(), plan, device)
        }
        TaskSpec::QaFile { path } => {
            qa_datapoints(read_qa_pairs(path)?, tokenizer.clone(), plan, device)
        }
        TaskSpec::Text { path } => text_datapoints(path, tokenizer.clone(), &plan, &device)?,
    };
    Ok(match run.init.debug {
        Some(DebugMode::ReplaceWithRandomTokens) => {
            replace_with_random_tokens(stream, tokenizer.vocab_size())
        }
        _ => stream,
    })
}

fn with_debug_repeats(stream: DatapointStream, debug: Option<&DebugMode>) -> DatapointStream {
    match debug {
        Some(DebugMode::RepeatNPoints { num_points }) => {
            Box::new(RepeatFirstN::new(stream, (*num_points).max(1)))
        }
        Some(DebugMode::RepeatPointNTimes { num_times }) => {
            Box::new(RepeatEach::new(stream, (*num_times).max(1)))
        }
        _ => stream,
    }
}

/// `(prev, next)` datapoint pairs for the single-step trainer, bounded by `num_batches`.
pub fn build_datapoint_pairs(run: &RunConfig, tokenizer: Rc<dyn TextTokenizer>) -> Result<PairStream> {
    let stream = base_stream(run, tokenizer)?;
    let has_actions = run.plan.get(SegmentKind::Action).is_some();
    let stream = match run.init.dataset.peek_every {
        Some(n) if has_actions => peek_every(stream, n),
        _ => strip_actions(stream),
    };
    let stream = with_debug_repeats(stream, run.init.debug.as_ref());
    Ok(Box::new(Pairs::new(stream).take(run.init.num_batches)))
}

/// Documents of `group_size` prefixed observations, bounded by `num_batches`.
pub fn build_documents(
    run: &RunConfig,
    tokenizer: Rc<dyn TextTokenizer>,
    group_size: usize,
) -> Result<DocumentStream> {
    let stream = with_debug_repeats(base_stream(run, tokenizer)?, run.init.debug.as_ref());
    let observations = stream.map(|d| d.map(|d| d.observation));
    Ok(Box::new(DocumentGrouper::new(observations, group_size).take(run.init.num_batches)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
