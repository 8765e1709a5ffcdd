//! Sentence segmentation of streamed transcript deltas
//!
//! The dialogue engine streams its reply as small text deltas. Synthesis works
//! best on whole sentences, so deltas are buffered until a terminal mark
//! closes a segment.

use regex::Regex;

use crate::{Error, Result};

/// Terminal marks used when none are configured
pub const DEFAULT_TERMINALS: &[&str] = &["。", "！", "？", "!", "?", "\n"];

/// Accumulated transcript text plus the rule that closes a segment
#[derive(Debug, Clone)]
pub struct TranscriptBuffer {
    text: String,
    boundary: Regex,
}

impl TranscriptBuffer {
    /// Build a buffer whose segments end at any of `terminals`
    ///
    /// # Errors
    ///
    /// Returns error if `terminals` is empty or contains an empty mark
    pub fn new<S: AsRef<str>>(terminals: &[S]) -> Result<Self> {
        if terminals.is_empty() || terminals.iter().any(|t| t.as_ref().is_empty()) {
            return Err(Error::Config(
                "sentence terminals must be non-empty".to_string(),
            ));
        }

        let alternatives = terminals
            .iter()
            .map(|t| regex::escape(t.as_ref()))
            .collect::<Vec<_>>()
            .join("|");

        // Lazy prefix: the first terminal closes the segment
        let boundary = Regex::new(&format!(r"^(?s:.*?)(?:{alternatives})"))
            .map_err(|e| Error::Config(format!("invalid sentence terminals: {e}")))?;

        Ok(Self {
            text: String::new(),
            boundary,
        })
    }

    /// Split off the next closed segment, if any
    fn take_closed(&mut self) -> Option<String> {
        let end = self.boundary.find(&self.text)?.end();
        let rest = self.text.split_off(end);
        Some(std::mem::replace(&mut self.text, rest))
    }

    /// Buffered text not yet closed by a terminal
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.text
    }
}

/// Turns a stream of transcript deltas into sentence-like segments
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    buffer: TranscriptBuffer,
}

impl SentenceSegmenter {
    /// Create a segmenter for the given terminal marks
    ///
    /// # Errors
    ///
    /// Returns error if the terminal set is unusable
    pub fn new<S: AsRef<str>>(terminals: &[S]) -> Result<Self> {
        Ok(Self {
            buffer: TranscriptBuffer::new(terminals)?,
        })
    }

    /// Append a delta and return every segment it completed, in order
    ///
    /// Whitespace-only matches are consumed but not returned.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.text.push_str(delta);

        let mut segments = Vec::new();
        while let Some(segment) = self.buffer.take_closed() {
            if segment.trim().is_empty() {
                tracing::trace!("skipping whitespace-only segment");
                continue;
            }
            segments.push(segment);
        }
        segments
    }

    /// End the turn, returning the trailing partial text as a final segment
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer.text);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }

    /// Drop any buffered text without emitting it
    pub fn clear(&mut self) {
        self.buffer.text.clear();
    }

    /// Buffered text awaiting a terminal mark
    #[must_use]
    pub fn pending(&self) -> &str {
        self.buffer.pending()
    }
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self {
            buffer: TranscriptBuffer::new(DEFAULT_TERMINALS)
                .unwrap_or_else(|_| unreachable!("default terminals are valid")),
        }
    }
}
