// RAO assembly: interleaving label prefixes with content blocks, building
// (Loss?, Action, Observation) triples into one batch-major token tensor and
// cutting long tensors into windows on triple boundaries.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};

use crate::budget::{fit_to_width, PadSide, Prefix, SegmentKind, SegmentPlan, TokenBudget};
use crate::error::RaoError;
use crate::tokenizer::TextTokenizer;

// ---------------------------------------------------------------------------
// intersperse
// ---------------------------------------------------------------------------

/// Insert `separator` (as a block) before element 0 and before every
/// `interval`-th element after it.
///
/// `intersperse(&[1, 2, 3, 4], &[0], 2) == [0, 1, 2, 0, 3, 4]`
pub fn intersperse<T: Clone>(primary: &[T], separator: &[T], interval: usize) -> Result<Vec<T>> {
    ensure!(interval >= 1, "intersperse interval must be >= 1");
    let blocks = primary.len().div_ceil(interval);
    let mut out = Vec::with_capacity(primary.len() + blocks * separator.len());
    for chunk in primary.chunks(interval) {
        out.extend_from_slice(separator);
        out.extend_from_slice(chunk);
    }
    Ok(out)
}

/// Prefix every `pure_width`-sized block of each row with `prefix`.
/// (batch, n * pure_width) -> (batch, n * (prefix.len() + pure_width))
pub fn prefix_blocks(rows: &Tensor, prefix: &[u32], pure_width: usize) -> Result<Tensor> {
    let (batch, len) = rows.dims2()?;
    ensure!(
        pure_width > 0 && len % pure_width == 0,
        "row length {len} is not a whole number of {pure_width}-token blocks"
    );
    let mut flat = Vec::with_capacity(batch * (len + len / pure_width * prefix.len()));
    for row in rows.to_vec2::<u32>()? {
        flat.extend(intersperse(&row, prefix, pure_width)?);
    }
    let width = flat.len() / batch;
    Tensor::from_vec(flat, (batch, width), rows.device()).map_err(Into::into)
}

/// Repeat each row `n` times in place: rows [a, b] with n=2 -> [a, a, b, b].
pub fn repeat_interleave(rows: &Tensor, n: usize) -> Result<Tensor> {
    if n <= 1 {
        return Ok(rows.clone());
    }
    let batch = rows.dim(0)? as u32;
    let idx: Vec<u32> = (0..batch).flat_map(|i| std::iter::repeat(i).take(n)).collect();
    let idx = Tensor::new(idx.as_slice(), rows.device())?;
    rows.index_select(&idx, 0).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// `prefix ++ content`, content right-padded or truncated to `pure_width`.
pub fn prefixed_row(prefix: &Prefix, content: &[u32], pure_width: usize, pad: u32) -> Vec<u32> {
    let mut row = prefix.ids.clone();
    row.extend(fit_to_width(content, pure_width, pad, PadSide::Right));
    row
}

/// Encode one text per batch row into a fixed-width segment of `kind`.
pub fn encode_segment(
    texts: &[String],
    kind: SegmentKind,
    tokenizer: &dyn TextTokenizer,
    plan: &SegmentPlan,
    device: &Device,
) -> Result<Tensor> {
    let prefix = plan.prefix(kind)?;
    let pure = plan.pure_width(kind);
    let mut flat = Vec::with_capacity(texts.len() * plan.width(kind));
    for text in texts {
        let ids = tokenizer.encode(text)?;
        flat.extend(prefixed_row(prefix, &ids, pure, tokenizer.pad_id()));
    }
    Tensor::from_vec(flat, (texts.len(), plan.width(kind)), device).map_err(Into::into)
}

/// The loss segment: label plus the per-row loss value rendered as text.
pub fn render_loss_segment(
    values: &[f32],
    tokenizer: &dyn TextTokenizer,
    plan: &SegmentPlan,
    device: &Device,
) -> Result<Tensor> {
    let texts: Vec<String> = values.iter().map(|v| format!("{v:.3}")).collect();
    encode_segment(&texts, SegmentKind::Loss, tokenizer, plan, device)
}

// ---------------------------------------------------------------------------
// Triples
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Triple {
    pub loss: Option<Tensor>,
    pub action: Tensor,
    pub observation: Tensor,
}

/// Concatenate triples along the position axis. Every segment must have its
/// configured width, so the result is `triples.len() * tok_p_rao` wide.
pub fn assemble_triples(triples: &[Triple], budget: &TokenBudget) -> Result<Tensor> {
    ensure!(!triples.is_empty(), "no triples to assemble");
    let mut parts: Vec<&Tensor> = Vec::with_capacity(triples.len() * 3);
    for (i, t) in triples.iter().enumerate() {
        match (&t.loss, budget.tok_p_loss) {
            (None, 0) => {}
            (Some(loss), w) if w > 0 => {
                check_width(loss, w, SegmentKind::Loss, i)?;
                parts.push(loss);
            }
            _ => anyhow::bail!("triple {i}: loss segment presence does not match tok_p_loss"),
        }
        check_width(&t.action, budget.tok_p_action, SegmentKind::Action, i)?;
        check_width(&t.observation, budget.tok_p_obs, SegmentKind::Observation, i)?;
        parts.push(&t.action);
        parts.push(&t.observation);
    }
    Tensor::cat(&parts, 1).map_err(Into::into)
}

fn check_width(segment: &Tensor, width: usize, kind: SegmentKind, index: usize) -> Result<()> {
    let got = segment.dim(1)?;
    ensure!(
        got == width,
        "triple {index}: {} segment is {got} wide, expected {width}",
        kind.name()
    );
    Ok(())
}

/// Split a RAO tensor into windows of at most `triples_per_window` triples.
pub fn window_chunks(seq: &Tensor, tok_p_rao: usize, triples_per_window: usize) -> Result<Vec<Tensor>> {
    ensure!(triples_per_window >= 1, "triples_per_window must be >= 1");
    let len = seq.dim(1)?;
    if tok_p_rao == 0 || len % tok_p_rao != 0 {
        return Err(RaoError::SegmentMisaligned { len, tok_p_rao }.into());
    }
    let window = tok_p_rao * triples_per_window;
    let mut out = Vec::with_capacity(len.div_ceil(window));
    let mut start = 0;
    while start < len {
        let take = window.min(len - start);
        out.push(seq.narrow(1, start, take)?);
        start += take;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    #[test]
    fn test_intersperse_examples() -> Result<()> {
        let xs: Vec<String> = (1..=6).map(|i| i.to_string()).collect();
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();

        assert_eq!(
            intersperse(&xs, &s(&["a"]), 2)?,
            s(&["a", "1", "2", "a", "3", "4", "a", "5", "6"])
        );
        assert_eq!(
            intersperse(&xs, &s(&["a", "b"]), 3)?,
            s(&["a", "b", "1", "2", "3", "a", "b", "4", "5", "6"])
        );
        let expected: Vec<String> = xs
            .iter()
            .flat_map(|x| s(&["a", "b", "c"]).into_iter().chain(std::iter::once(x.clone())))
            .collect();
        assert_eq!(intersperse(&xs, &s(&["a", "b", "c"]), 1)?, expected);
        Ok(())
    }

    #[test]
    fn test_repeat_interleave_rows() -> Result<()> {
        let rows = Tensor::new(&[[1u32, 2], [3, 4]], &Device::Cpu)?;
        let out = repeat_interleave(&rows, 3)?.to_vec2::<u32>()?;
        assert_eq!(out, vec![vec![1, 2], vec![1, 2], vec![1, 2], vec![3, 4], vec![3, 4], vec![3, 4]]);
        assert_eq!(repeat_interleave(&rows, 1)?.dims2()?, (2, 2));
        Ok(())
    }

    #[test]
    fn test_intersperse_length_and_order() -> Result<()> {
        for n in 0..12usize {
            for k in 1..5usize {
                let xs: Vec<i64> = (0..n as i64).collect();
                let sep = [-1i64, -2];
                let out = intersperse(&xs, &sep, k)?;
                assert_eq!(out.len(), n + n.div_ceil(k) * sep.len());
                let kept: Vec<i64> = out.iter().copied().filter(|&x| x >= 0).collect();
                assert_eq!(kept, xs);
                if n > 0 {
                    assert_eq!(&out[..2], &sep);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_intersperse_zero_interval_fails() {
        assert!(intersperse(&[1, 2], &[0], 0).is_err());
    }

    #[test]
    fn test_prefix_blocks() -> Result<()> {
        let rows = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu)?;
        let out = prefix_blocks(&rows, &[9], 2)?;
        assert_eq!(
            out.to_vec2::<u32>()?,
            vec![vec![9, 1, 2, 9, 3, 4], vec![9, 5, 6, 9, 7, 8]]
        );
        Ok(())
    }

    #[test]
    fn test_assemble_and_window() -> Result<()> {
        let dev = Device::Cpu;
        let budget = TokenBudget { tok_p_loss: 2, tok_p_action: 3, tok_p_obs: 4 };
        let triple = |v: u32| -> Result<Triple> {
            Ok(Triple {
                loss: Some(Tensor::full(v, (1, 2), &dev)?),
                action: Tensor::full(v + 1, (1, 3), &dev)?,
                observation: Tensor::full(v + 2, (1, 4), &dev)?,
            })
        };
        let seq = assemble_triples(&[triple(0)?, triple(10)?, triple(20)?], &budget)?;
        assert_eq!(seq.dims2()?, (1, 27));
        let windows = window_chunks(&seq, budget.tok_p_rao(), 2)?;
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].dim(1)?, 18);
        assert_eq!(windows[1].dim(1)?, 9);
        assert_eq!(windows[1].to_vec2::<u32>()?[0][0], 20);
        Ok(())
    }

    #[test]
    fn test_assemble_rejects_wrong_width() -> Result<()> {
        let dev = Device::Cpu;
        let budget = TokenBudget { tok_p_loss: 0, tok_p_action: 3, tok_p_obs: 4 };
        let bad = Triple {
            loss: None,
            action: Tensor::zeros((1, 2), candle_core::DType::U32, &dev)?,
            observation: Tensor::zeros((1, 4), candle_core::DType::U32, &dev)?,
        };
        assert!(assemble_triples(&[bad], &budget).is_err());
        Ok(())
    }

    #[test]
    fn test_window_chunks_misaligned() -> Result<()> {
        let seq = Tensor::zeros((1, 10), candle_core::DType::U32, &Device::Cpu)?;
        let err = window_chunks(&seq, 3, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RaoError>(),
            Some(RaoError::SegmentMisaligned { len: 10, tok_p_rao: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_render_loss_segment() -> Result<()> {
        let tok = ByteTokenizer;
        let budget = TokenBudget::rao(512, 1.0, 2, 16)?;
        let plan = SegmentPlan::build(budget, &tok, 2, &Device::Cpu)?;
        let seg = render_loss_segment(&[1.5, 0.25], &tok, &plan, &Device::Cpu)?;
        assert_eq!(seg.dims2()?, (2, 16));
        let rows = seg.to_vec2::<u32>()?;
        assert_eq!(tok.decode(&rows[0])?, "\nLoss: 1.500");
        assert_eq!(tok.decode(&rows[1])?, "\nLoss: 0.250");
        Ok(())
    }
}
