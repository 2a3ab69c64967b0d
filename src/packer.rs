// Sequence packing: variable-length token chunks -> fixed-width observation
// blocks -> prefixed blocks -> documents of N blocks.
//
// Every stage is a pull-based iterator over Result items. A stage that fails
// yields its error once and is fused afterwards. Restarting means rebuilding
// the pipeline.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::assemble::prefix_blocks;
use crate::error::RaoError;

// ---------------------------------------------------------------------------
// SequencePacker
// ---------------------------------------------------------------------------

/// Packs a shared chunk stream into `(batch, pure_width)` blocks.
///
/// Each batch row is a slot with its own buffer. Slots are topped up in order
/// from the stream until they hold `pure_width` tokens; the surplus stays in the
/// slot for its next block, so rows never share tokens.
pub struct SequencePacker<I> {
    chunks: I,
    buffers: Vec<Vec<u32>>,
    pure_width: usize,
    device: Device,
    done: bool,
}

impl<I> SequencePacker<I>
where
    I: Iterator<Item = Result<Vec<u32>>>,
{
    pub fn new(chunks: I, batch_size: usize, pure_width: usize, device: &Device) -> Self {
        Self {
            chunks,
            buffers: vec![Vec::new(); batch_size],
            pure_width,
            device: device.clone(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<Tensor> {
        let need = self.pure_width;
        for (slot, buf) in self.buffers.iter_mut().enumerate() {
            while buf.len() < need {
                match self.chunks.next() {
                    Some(chunk) => buf.extend(chunk?),
                    None => {
                        return Err(RaoError::StreamExhausted { slot, have: buf.len(), need }.into())
                    }
                }
            }
        }
        let batch = self.buffers.len();
        let mut flat = Vec::with_capacity(batch * need);
        for buf in self.buffers.iter_mut() {
            flat.extend(buf.drain(..need));
        }
        Tensor::from_vec(flat, (batch, need), &self.device).map_err(Into::into)
    }
}

impl<I> Iterator for SequencePacker<I>
where
    I: Iterator<Item = Result<Vec<u32>>>,
{
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let out = self.fill();
        if let Err(e) = &out {
            tracing::warn!("[PACKER] stopping: {e}");
            self.done = true;
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// PrefixedBlocks
// ---------------------------------------------------------------------------

/// Prepends the observation label to every packed block.
pub struct PrefixedBlocks<I> {
    blocks: I,
    prefix: Vec<u32>,
    pure_width: usize,
}

impl<I> PrefixedBlocks<I> {
    pub fn new(blocks: I, prefix: Vec<u32>, pure_width: usize) -> Self {
        Self { blocks, prefix, pure_width }
    }
}

impl<I> Iterator for PrefixedBlocks<I>
where
    I: Iterator<Item = Result<Tensor>>,
{
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.blocks.next()?;
        Some(block.and_then(|b| prefix_blocks(&b, &self.prefix, self.pure_width)))
    }
}

// ---------------------------------------------------------------------------
// DocumentGrouper
// ---------------------------------------------------------------------------

/// Stacks `group_size` consecutive blocks into `(batch, group_size, width)`.
/// A trailing partial group is dropped.
pub struct DocumentGrouper<I> {
    blocks: I,
    group_size: usize,
    done: bool,
}

impl<I> DocumentGrouper<I> {
    pub fn new(blocks: I, group_size: usize) -> Self {
        Self { blocks, group_size, done: false }
    }
}

impl<I> Iterator for DocumentGrouper<I>
where
    I: Iterator<Item = Result<Tensor>>,
{
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut group = Vec::with_capacity(self.group_size);
        while group.len() < self.group_size {
            match self.blocks.next() {
                Some(Ok(block)) => group.push(block),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
        Some(Tensor::stack(&group, 1).map_err(Into::into))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{ByteTokenizer, TextTokenizer};

    fn chunks(data: Vec<Vec<u32>>) -> impl Iterator<Item = Result<Vec<u32>>> {
        data.into_iter().map(Ok)
    }

    #[test]
    fn test_slots_keep_their_own_tokens() -> Result<()> {
        let stream = chunks(vec![vec![1, 2, 3], vec![10, 11], vec![4], vec![12, 13]]);
        let mut packer = SequencePacker::new(stream, 2, 2, &Device::Cpu);

        let first = packer.next().expect("block")?;
        assert_eq!(first.to_vec2::<u32>()?, vec![vec![1, 2], vec![10, 11]]);

        // Slot 0 kept [3] and pulls [4]; slot 1 is empty and pulls [12,13].
        let second = packer.next().expect("block")?;
        assert_eq!(second.to_vec2::<u32>()?, vec![vec![3, 4], vec![12, 13]]);
        Ok(())
    }

    #[test]
    fn test_exhaustion_reported_once() -> Result<()> {
        let stream = chunks(vec![vec![1, 2], vec![3]]);
        let mut packer = SequencePacker::new(stream, 2, 2, &Device::Cpu);
        let err = packer.next().expect("error item").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RaoError>(),
            Some(RaoError::StreamExhausted { slot: 1, have: 1, need: 2 })
        ));
        assert!(packer.next().is_none());
        Ok(())
    }

    #[test]
    fn test_every_row_starts_with_prefix() -> Result<()> {
        let tok = ByteTokenizer;
        let prefix = tok.encode("\nObservation: ")?;
        let text = "the quick brown fox jumps over the lazy dog ".repeat(40);
        let words: Vec<Vec<u32>> = text
            .split_inclusive(' ')
            .map(|w| tok.encode(w))
            .collect::<Result<_>>()?;
        let packer = SequencePacker::new(words.into_iter().map(Ok), 3, 20, &Device::Cpu);
        let prefixed = PrefixedBlocks::new(packer, prefix.clone(), 20);

        let mut seen = 0;
        for block in prefixed.take(5) {
            let block = block?;
            assert_eq!(block.dims2()?, (3, prefix.len() + 20));
            for row in block.to_vec2::<u32>()? {
                assert!(tok.decode(&row)?.starts_with("\nObservation:"));
            }
            seen += 1;
        }
        assert_eq!(seen, 5);
        Ok(())
    }

    #[test]
    fn test_document_grouping() -> Result<()> {
        let stream = chunks((0..20u32).map(|i| vec![i]).collect());
        let packer = SequencePacker::new(stream, 1, 3, &Device::Cpu);
        let docs: Vec<Tensor> = DocumentGrouper::new(packer, 2)
            .take_while(|d| d.is_ok())
            .collect::<Result<_>>()?;
        // 20 tokens -> 6 blocks of 3 -> 3 documents, then exhaustion.
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].dims3()?, (1, 2, 3));
        assert_eq!(docs[1].to_vec3::<u32>()?[0], vec![vec![6, 7, 8], vec![9, 10, 11]]);
        Ok(())
    }
}
