use anyhow::Result;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

/// BPE token counter used to estimate prompt size when a backend does not
/// report usage.
pub struct Tokenizer {
    encoder: Arc<CoreBPE>,
}

impl Tokenizer {
    pub fn new(model: &str) -> Result<Self> {
        let encoder = if model.contains("gpt-4o") {
            o200k_base()?
        } else {
            // Default to cl100k for everything else
            cl100k_base()?
        };

        Ok(Self {
            encoder: Arc::new(encoder),
        })
    }

    /// Tokens in the raw prompt text. Chat templates add framing tokens on
    /// the server side, so the real prompt is somewhat longer.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }
}
