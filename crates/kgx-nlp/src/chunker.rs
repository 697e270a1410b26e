//! Sentence splitting and token windowing
//!
//! Splits raw text into sentences and partitions each sentence's sub-word
//! tokens into fixed-size windows. A multi-token word is never split
//! across windows.

use std::sync::Arc;

use kgx_core::{LanguageModel, Token};

/// Default window size in sub-word tokens
pub const DEFAULT_WINDOW_TOKENS: usize = 64;

/// Abbreviations that do not terminate a sentence
const ABBREVIATIONS: &[&str] = &[
    "Mr", "Mrs", "Ms", "Dr", "Prof", "Inc", "Corp", "Ltd", "Co", "St", "vs", "etc", "e.g", "i.e",
    "Jr", "Sr", "No",
];

/// One sentence of a batch, with its offset in the batch text
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    /// Sentence text
    pub text: String,

    /// Byte offset of the sentence in the batch text
    pub start: usize,

    /// Position of the sentence within the batch
    pub index: usize,
}

/// A model-sized window over one sentence's tokens
#[derive(Debug, Clone)]
pub struct TokenWindow {
    /// Tokens in the window; offsets are relative to the sentence
    pub tokens: Vec<Token>,
}

/// Splits text into sentences and sentences into token windows
pub struct Chunker {
    model: Arc<dyn LanguageModel>,
    window_size: usize,
}

impl Chunker {
    /// Create a chunker with the default window size
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            window_size: DEFAULT_WINDOW_TOKENS,
        }
    }

    /// Override the window size
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    /// Split raw text into sentences.
    ///
    /// Terminators are `.`, `!`, `?`; a period after a known abbreviation
    /// or between digits does not end a sentence.
    pub fn split_sentences(&self, text: &str) -> Vec<Sentence> {
        let mut sentences = Vec::new();
        let mut sentence_start = 0;
        let bytes = text.as_bytes();

        let mut chars = text.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            let terminator = matches!(ch, '.' | '!' | '?');
            if !terminator {
                continue;
            }

            if ch == '.' {
                // Decimal point
                let prev_digit = idx > 0 && bytes[idx - 1].is_ascii_digit();
                let next_digit = chars
                    .peek()
                    .map(|(_, c)| c.is_ascii_digit())
                    .unwrap_or(false);
                if prev_digit && next_digit {
                    continue;
                }

                if ends_with_abbreviation(&text[sentence_start..idx]) {
                    continue;
                }
            }

            let end = idx + ch.len_utf8();
            push_sentence(&mut sentences, text, sentence_start, end);
            sentence_start = end;
        }
        push_sentence(&mut sentences, text, sentence_start, text.len());

        sentences
    }

    /// Partition a sentence's tokens into windows.
    ///
    /// The fragments of one word always land in the same window; a word
    /// whose fragments alone exceed the window size gets a window of its
    /// own rather than being split.
    pub fn windows(&self, sentence: &Sentence) -> Vec<TokenWindow> {
        let tokens = self.model.tokenize(&sentence.text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut windows = Vec::new();
        let mut current: Vec<Token> = Vec::new();

        let mut word: Vec<Token> = Vec::new();
        for token in tokens {
            if !token.continuation && !word.is_empty() {
                append_word(&mut windows, &mut current, &mut word, self.window_size);
            }
            word.push(token);
        }
        append_word(&mut windows, &mut current, &mut word, self.window_size);

        if !current.is_empty() {
            windows.push(TokenWindow { tokens: current });
        }

        windows
    }
}

fn append_word(
    windows: &mut Vec<TokenWindow>,
    current: &mut Vec<Token>,
    word: &mut Vec<Token>,
    window_size: usize,
) {
    if word.is_empty() {
        return;
    }

    if !current.is_empty() && current.len() + word.len() > window_size {
        windows.push(TokenWindow {
            tokens: std::mem::take(current),
        });
    }
    current.append(word);
}

fn push_sentence(sentences: &mut Vec<Sentence>, text: &str, start: usize, end: usize) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }

    let leading = raw.len() - raw.trim_start().len();
    sentences.push(Sentence {
        text: trimmed.to_string(),
        start: start + leading,
        index: sentences.len(),
    });
}

fn ends_with_abbreviation(prefix: &str) -> bool {
    let last_word = prefix
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    ABBREVIATIONS
        .iter()
        .any(|abbr| last_word.eq_ignore_ascii_case(abbr))
}

// ============================================================================
// Tests
// ============================================================================
