// Tokenizers: the capability the harness needs from a text tokenizer, plus
// two implementations.
//
//   ByteTokenizer: 256 raw bytes + PAD + EOS. No files, used by tests and tiers.
//   HfTokenizer:   a pretrained `tokenizer.json`; pad is the id of " ".

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// What the RAO pipeline needs from a tokenizer. Encoding never adds special tokens.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn pad_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    fn vocab_size(&self) -> usize;

    /// Id of a single space. Used for trailing-pad perturbations.
    fn space_id(&self) -> Result<u32> {
        self.encode(" ")?
            .last()
            .copied()
            .context("tokenizer produced no id for a space")
    }

    /// Persist whatever is needed to reload this tokenizer next to a checkpoint.
    fn save(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Byte-level tokenizer
// ---------------------------------------------------------------------------

pub const BYTE_PAD: u32 = 256;
pub const BYTE_EOS: u32 = 257;
pub const BYTE_VOCAB_SIZE: usize = 258; // 256 bytes + PAD + EOS

#[derive(Clone, Copy, Debug, Default)]
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < 256)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pad_id(&self) -> u32 {
        BYTE_PAD
    }

    fn eos_id(&self) -> u32 {
        BYTE_EOS
    }

    fn vocab_size(&self) -> usize {
        BYTE_VOCAB_SIZE
    }
}

// ---------------------------------------------------------------------------
// Pretrained tokenizer (tokenizer.json)
// ---------------------------------------------------------------------------

const EOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "</s>", "<eos>"];

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    source: PathBuf,
    pad: u32,
    eos: u32,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("loading tokenizer {}: {e}", path.display()))?;
        let pad = inner
            .encode(" ", false)
            .map_err(|e| anyhow::anyhow!("encoding pad token: {e}"))?
            .get_ids()
            .first()
            .copied()
            .context("tokenizer cannot encode a space")?;
        let eos = EOS_CANDIDATES
            .iter()
            .find_map(|tok| inner.token_to_id(tok))
            .unwrap_or(pad);
        tracing::info!("[TOKENIZER] loaded {} (pad={pad}, eos={eos})", path.display());
        Ok(Self { inner, source: path.to_path_buf(), pad, eos })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode failed: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("decode failed: {e}"))
    }

    fn pad_id(&self) -> u32 {
        self.pad
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let dest = dir.join("tokenizer.json");
        std::fs::copy(&self.source, &dest)
            .with_context(|| format!("copying tokenizer to {}", dest.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_roundtrip() -> Result<()> {
        let tok = ByteTokenizer;
        let ids = tok.encode("\nAction: hi")?;
        assert_eq!(ids.len(), 11);
        assert_eq!(tok.decode(&ids)?, "\nAction: hi");
        Ok(())
    }

    #[test]
    fn test_byte_decode_skips_specials() -> Result<()> {
        let tok = ByteTokenizer;
        let ids = vec![b'o' as u32, BYTE_PAD, b'k' as u32, BYTE_EOS];
        assert_eq!(tok.decode(&ids)?, "ok");
        Ok(())
    }

    #[test]
    fn test_byte_space_id() -> Result<()> {
        assert_eq!(ByteTokenizer.space_id()?, b' ' as u32);
        Ok(())
    }
}
