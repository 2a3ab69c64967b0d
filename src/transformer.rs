use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::{CausalLm, TrainScope};
use crate::training::{load_checkpoint, save_checkpoint};

// ---------------------------------------------------------------------------
// Gradient-safe RmsNorm (candle_nn::RmsNorm has broken backward pass)
// ---------------------------------------------------------------------------

struct GradRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GradRmsNorm {
    fn new(d_model: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(d_model, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?.broadcast_mul(&self.weight).map_err(Into::into)
    }
}

// Gradient-safe softmax (candle_nn::ops::softmax_last_dim has broken backward)
fn grad_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    /// Rank of the low-rank adapter on the LM head.
    pub adapter_rank: usize,
}

impl TransformerConfig {
    /// Byte vocabulary, 1k context: d=256, 4 layers, 8 heads.
    pub fn small() -> Self {
        Self {
            d_model: 256,
            n_layers: 4,
            n_heads: 8,
            d_ff: 1024,
            vocab_size: 258,
            max_seq_len: 1024,
            adapter_rank: 8,
        }
    }

    /// Byte vocabulary, 256 positions, one layer. Fast enough for tests.
    pub fn tiny() -> Self {
        Self {
            d_model: 32,
            n_layers: 1,
            n_heads: 2,
            d_ff: 64,
            vocab_size: 258,
            max_seq_len: 256,
            adapter_rank: 4,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}

// ---------------------------------------------------------------------------
// RoPE
// ---------------------------------------------------------------------------

fn precompute_rope(seq_len: usize, head_dim: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let theta: Vec<f32> = (0..half)
        .map(|i| 1.0f32 / 10000f32.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let theta = Tensor::new(theta, device)?;
    let positions: Vec<f32> = (0..seq_len).map(|p| p as f32).collect();
    let positions = Tensor::new(positions, device)?;
    let freqs = positions.unsqueeze(1)?.matmul(&theta.unsqueeze(0)?)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    // x: (batch, heads, seq, head_dim)
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;

    let seq_len = x.dim(2)?;
    let cos = cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

    let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
    let rotated_x2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
    Tensor::cat(&[rotated_x1, rotated_x2], D::Minus1).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    qkv: [Linear; 3],
    o_proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            qkv: [
                linear_no_bias(d, d, vb.pp("q_proj"))?,
                linear_no_bias(d, d, vb.pp("k_proj"))?,
                linear_no_bias(d, d, vb.pp("v_proj"))?,
            ],
            o_proj: linear_no_bias(d, d, vb.pp("o_proj"))?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn heads(&self, proj: &Linear, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        proj.forward(x)?
            .reshape((b, s, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
            .map_err(Into::into)
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        let q = apply_rope(&self.heads(&self.qkv[0], x)?, cos, sin)?;
        let k = apply_rope(&self.heads(&self.qkv[1], x)?, cos, sin)?;
        let v = self.heads(&self.qkv[2], x)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? / scale)?;
        let attn = grad_softmax_last_dim(&attn.broadcast_add(mask)?)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, s, self.n_heads * self.head_dim))?;
        self.o_proj.forward(&out).map_err(Into::into)
    }
}

fn build_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0f32 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// MLP + Block
// ---------------------------------------------------------------------------

struct Mlp {
    gate: Linear,
    down: Linear,
}

impl Mlp {
    fn new(d_model: usize, d_ff: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate: linear(d_model, d_ff, vb.pp("gate"))?,
            down: linear(d_ff, d_model, vb.pp("down"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.gate.forward(x)?.gelu()?;
        self.down.forward(&h).map_err(Into::into)
    }
}

struct TransformerBlock {
    attn_norm: GradRmsNorm,
    attn: Attention,
    mlp_norm: GradRmsNorm,
    mlp: Mlp,
}

impl TransformerBlock {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn_norm: GradRmsNorm::new(cfg.d_model, 1e-6, vb.pp("attn_norm"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            mlp_norm: GradRmsNorm::new(cfg.d_model, 1e-6, vb.pp("mlp_norm"))?,
            mlp: Mlp::new(cfg.d_model, cfg.d_ff, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let h = self.attn.forward(&self.attn_norm.forward(x)?, cos, sin, mask)?;
        let x = (x + h)?;
        let h = self.mlp.forward(&self.mlp_norm.forward(&x)?)?;
        (x + h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// RaoTransformer
// ---------------------------------------------------------------------------

/// RoPE decoder with two extra heads:
///   adapter:    lm_head(h) + up(down(h)); `up` starts at zero so the adapter
///               initially reproduces the base policy
///   value head: h -> scalar per position (critic)
///
/// Base weights and head weights live in separate VarMaps so heads-only
/// training never touches the base network.
pub struct RaoTransformer {
    pub config: TransformerConfig,
    base: VarMap,
    heads: VarMap,
    tok_emb: Embedding,
    layers: Vec<TransformerBlock>,
    final_norm: GradRmsNorm,
    lm_head: Linear,
    adapter_down: Linear,
    adapter_up: Linear,
    value_head: Linear,
    rope_cos: Tensor,
    rope_sin: Tensor,
}

impl RaoTransformer {
    pub fn new(cfg: TransformerConfig, device: &Device) -> Result<Self> {
        let base = VarMap::new();
        let heads = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let hb = VarBuilder::from_varmap(&heads, DType::F32, device);

        let tok_emb = embedding(cfg.vocab_size, cfg.d_model, vb.pp("tok_emb"))?;
        let layers = (0..cfg.n_layers)
            .map(|i| TransformerBlock::new(&cfg, vb.pp(format!("layer_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = GradRmsNorm::new(cfg.d_model, 1e-6, vb.pp("final_norm"))?;
        let lm_head = linear_no_bias(cfg.d_model, cfg.vocab_size, vb.pp("lm_head"))?;

        let adapter_down = linear_no_bias(cfg.d_model, cfg.adapter_rank, hb.pp("adapter_down"))?;
        let up_w = hb.pp("adapter_up").get_with_hints(
            (cfg.vocab_size, cfg.adapter_rank),
            "weight",
            candle_nn::Init::Const(0.0),
        )?;
        let adapter_up = Linear::new(up_w, None);
        let value_head = linear(cfg.d_model, 1, hb.pp("value_head"))?;

        let (rope_cos, rope_sin) = precompute_rope(cfg.max_seq_len, cfg.head_dim(), device)?;
        Ok(Self {
            config: cfg,
            base,
            heads,
            tok_emb,
            layers,
            final_norm,
            lm_head,
            adapter_down,
            adapter_up,
            value_head,
            rope_cos,
            rope_sin,
        })
    }

    /// Hidden states after the final norm, (batch, seq, d_model).
    pub fn encode(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            seq_len <= self.config.max_seq_len,
            "sequence of {seq_len} tokens exceeds max_seq_len {}",
            self.config.max_seq_len
        );
        let mask = build_causal_mask(seq_len, input_ids.device())?;
        let mut x = self.tok_emb.forward(input_ids)?;
        for layer in &self.layers {
            x = layer.forward(&x, &self.rope_cos, &self.rope_sin, &mask)?;
        }
        self.final_norm.forward(&x)
    }
}

impl CausalLm for RaoTransformer {
    fn logits(&self, input_ids: &Tensor, use_adapter: bool) -> Result<Tensor> {
        let h = self.encode(input_ids)?;
        let logits = self.lm_head.forward(&h)?;
        if !use_adapter {
            return Ok(logits);
        }
        let delta = self.adapter_up.forward(&self.adapter_down.forward(&h)?)?;
        (logits + delta).map_err(Into::into)
    }

    fn values(&self, input_ids: &Tensor) -> Result<Tensor> {
        let h = self.encode(input_ids)?;
        self.value_head.forward(&h)?.squeeze(D::Minus1).map_err(Into::into)
    }

    fn max_positions(&self) -> usize {
        self.config.max_seq_len
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn trainable_vars(&self, scope: TrainScope) -> Vec<Var> {
        let mut vars = self.heads.all_vars();
        if scope == TrainScope::Full {
            vars.extend(self.base.all_vars());
        }
        vars
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        save_checkpoint(&self.base, &dir.join("base.safetensors"))?;
        save_checkpoint(&self.heads, &dir.join("heads.safetensors"))
    }

    fn load(&self, dir: &Path) -> Result<()> {
        let device = self.rope_cos.device();
        load_checkpoint(&self.base, &dir.join("base.safetensors"), device)?;
        load_checkpoint(&self.heads, &dir.join("heads.safetensors"), device)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Optimizer;

    fn tiny() -> Result<RaoTransformer> {
        RaoTransformer::new(TransformerConfig::tiny(), &Device::Cpu)
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let model = tiny()?;
        let input = Tensor::zeros((2, 8), DType::U32, &Device::Cpu)?;
        assert_eq!(model.logits(&input, true)?.dims3()?, (2, 8, 258));
        assert_eq!(model.values(&input)?.dims2()?, (2, 8));
        assert_eq!(model.encode(&input)?.dims3()?, (2, 8, 32));
        Ok(())
    }

    #[test]
    fn test_adapter_starts_as_identity() -> Result<()> {
        let model = tiny()?;
        let input = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu)?;
        let on = model.logits(&input, true)?;
        let off = model.logits(&input, false)?;
        let diff = (on - off)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "fresh adapter should not change logits: {diff}");
        Ok(())
    }

    #[test]
    fn test_rejects_overlong_sequence() -> Result<()> {
        let model = tiny()?;
        let input = Tensor::zeros((1, 257), DType::U32, &Device::Cpu)?;
        assert!(model.logits(&input, false).is_err());
        Ok(())
    }

    #[test]
    fn test_rope_positions() -> Result<()> {
        let (cos, sin) = precompute_rope(4, 8, &Device::Cpu)?;
        assert_eq!(cos.dims2()?, (4, 4));
        for &v in &cos.get(0)?.to_vec1::<f32>()? {
            assert!((v - 1.0).abs() < 1e-5, "cos(0) should be 1.0, got {v}");
        }
        for &v in &sin.get(0)?.to_vec1::<f32>()? {
            assert!(v.abs() < 1e-5, "sin(0) should be 0.0, got {v}");
        }
        Ok(())
    }

    #[test]
    fn test_heads_only_scope() -> Result<()> {
        let model = tiny()?;
        let heads = model.trainable_vars(TrainScope::HeadsOnly).len();
        let full = model.trainable_vars(TrainScope::Full).len();
        // adapter_down, adapter_up, value_head weight + bias
        assert_eq!(heads, 4);
        assert!(full > heads);
        Ok(())
    }

    #[test]
    fn test_training_step_reduces_loss() -> Result<()> {
        let model = tiny()?;
        let mut opt = candle_nn::AdamW::new(
            model.trainable_vars(TrainScope::Full),
            candle_nn::ParamsAdamW { lr: 1e-3, ..Default::default() },
        )?;
        let input = Tensor::new(&[[1u32, 2, 3, 4, 5, 6, 7, 8]], &Device::Cpu)?;
        let target = Tensor::new(&[2u32, 3, 4, 5, 6, 7, 8, 9], &Device::Cpu)?;

        let mut losses = Vec::new();
        for _ in 0..30 {
            let logits = model.logits(&input, true)?.squeeze(0)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &target)?;
            losses.push(loss.to_scalar::<f32>()?);
            opt.backward_step(&loss)?;
        }
        assert!(losses[29] < losses[0], "loss should decrease: {losses:?}");
        Ok(())
    }

    #[test]
    fn test_save_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = tiny()?;
        let b = tiny()?;
        a.save(dir.path())?;
        b.load(dir.path())?;
        let input = Tensor::new(&[[5u32, 6, 7]], &Device::Cpu)?;
        let diff = (a.logits(&input, true)? - b.logits(&input, true)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
