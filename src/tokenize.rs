//! Tokenizer contract used to measure and split model inputs.
//!
//! Real tokenizers are provided by the model runtime. The two implementations
//! here cover backends that expose none (remote APIs) and tests.

/// A model-internal unit with its byte span in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Splits text into model-internal units
pub trait Tokenizer: Send + Sync {
    /// Tokenize `text`, reporting byte offsets into it
    fn tokenize(&self, text: &str) -> Vec<Token>;

    /// Number of units `text` occupies
    fn count(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }
}

/// Splits on whitespace and isolates ASCII punctuation
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut start: Option<usize> = None;

        for (idx, ch) in text.char_indices() {
            if ch.is_whitespace() || ch.is_ascii_punctuation() {
                if let Some(s) = start.take() {
                    tokens.push(Token {
                        text: text[s..idx].to_string(),
                        start: s,
                        end: idx,
                    });
                }
                if ch.is_ascii_punctuation() {
                    let end = idx + ch.len_utf8();
                    tokens.push(Token {
                        text: text[idx..end].to_string(),
                        start: idx,
                        end,
                    });
                }
            } else if start.is_none() {
                start = Some(idx);
            }
        }

        if let Some(s) = start {
            tokens.push(Token {
                text: text[s..].to_string(),
                start: s,
                end: text.len(),
            });
        }

        tokens
    }
}

/// Whitespace tokenization followed by splitting each word into chunks of at
/// most `max_chars` characters, approximating sub-word units
#[derive(Debug, Clone, Copy)]
pub struct ChunkTokenizer {
    pub max_chars: usize,
}

impl ChunkTokenizer {
    #[must_use]
    pub const fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Tokenizer for ChunkTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let max_chars = self.max_chars.max(1);
        let mut tokens = Vec::new();

        for word in WhitespaceTokenizer.tokenize(text) {
            let mut chunk_start = word.start;
            let mut chars_in_chunk = 0;
            for (offset, _) in word.text.char_indices() {
                if chars_in_chunk == max_chars {
                    let idx = word.start + offset;
                    tokens.push(Token {
                        text: text[chunk_start..idx].to_string(),
                        start: chunk_start,
                        end: idx,
                    });
                    chunk_start = idx;
                    chars_in_chunk = 0;
                }
                chars_in_chunk += 1;
            }
            tokens.push(Token {
                text: text[chunk_start..word.end].to_string(),
                start: chunk_start,
                end: word.end,
            });
        }

        tokens
    }
}
