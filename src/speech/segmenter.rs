//! Sentence segmentation for speech synthesis.
//!
//! Text is scanned codepoint by codepoint and split after each run of
//! sentence delimiters (Latin `. ! ?`, newline, and the Arabic-script
//! question mark, full stop and comma). Delimiters stay attached to the
//! segment they end. Fragments of two characters or fewer are dropped.

use std::ops::Range;

const DELIMITERS: &[char] = &['.', '!', '?', '\n', '\u{061F}', '\u{06D4}', '\u{060C}'];

const MIN_SEGMENT_CHARS: usize = 3;

fn is_delimiter(c: char) -> bool {
    DELIMITERS.contains(&c)
}

/// A contiguous slice of the input, ending after a delimiter run unless it
/// is the unterminated tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub range: Range<usize>,
    pub terminated: bool,
}

/// Split `text` into contiguous spans covering it exactly.
pub fn spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !is_delimiter(c) {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if !is_delimiter(next) {
                break;
            }
            chars.next();
        }
        let end = chars.peek().map_or(text.len(), |&(i, _)| i);
        spans.push(Span {
            range: start..end,
            terminated: true,
        });
        start = end;
    }

    if start < text.len() {
        spans.push(Span {
            range: start..text.len(),
            terminated: false,
        });
    }

    spans
}

fn speakable(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (trimmed.chars().count() >= MIN_SEGMENT_CHARS).then(|| trimmed.to_string())
}

/// Ordered, trimmed utterances of `text`.
pub fn segment(text: &str) -> Vec<String> {
    spans(text)
        .into_iter()
        .filter_map(|span| speakable(&text[span.range]))
        .collect()
}

/// Tracks how much of a growing answer has already been handed out.
#[derive(Debug, Default)]
pub struct SegmentCursor {
    consumed: usize,
}

impl SegmentCursor {
    /// Newly terminated segments of `text` since the last call.
    ///
    /// `text` must extend the text seen by earlier calls.
    pub fn advance(&mut self, text: &str) -> Vec<String> {
        self.take(text, false)
    }

    /// Like [`advance`](Self::advance), but also flushes the unterminated tail.
    pub fn finish(&mut self, text: &str) -> Vec<String> {
        self.take(text, true)
    }

    fn take(&mut self, text: &str, flush: bool) -> Vec<String> {
        let Some(rest) = text.get(self.consumed..) else {
            return Vec::new();
        };
        let base = self.consumed;
        let mut out = Vec::new();
        for span in spans(rest) {
            // A delimiter run touching the end may still grow ("?" then "?!").
            if !flush && (!span.terminated || span.range.end == rest.len()) {
                break;
            }
            self.consumed = base + span.range.end;
            if let Some(s) = speakable(&rest[span.range]) {
                out.push(s);
            }
        }
        out
    }
}
