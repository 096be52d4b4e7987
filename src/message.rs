//! Conversation data model: messages, grounding sources and stream chunks.
//!
//! Also owns the answer text convention: an assistant answer may carry an
//! `OFFICIAL VERBATIM RECORD` block after its body, which [`ParsedAnswer`]
//! splits out for display and citation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker separating the spoken answer from the quoted fatwa record.
pub const VERBATIM_MARKER: &str = "OFFICIAL VERBATIM RECORD";

const FATWA_ID_LABEL: &str = "Fatwa ID:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A grounding reference. Identity is the URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

impl Source {
    pub fn new(title: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            uri: uri.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Lookup-only back-reference to the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub id: Uuid,
    pub snippet: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    /// Set when the turn ended in an error notice instead of an answer.
    #[serde(default)]
    pub failed: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Vec::new(),
            image: None,
            reply_to: None,
            failed: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Back-reference to this message, with the content cut to `max_chars`.
    pub fn reply_ref(&self, max_chars: usize) -> ReplyTo {
        ReplyTo {
            id: self.id,
            snippet: self.content.chars().take(max_chars).collect(),
            role: self.role,
        }
    }

    pub fn parsed(&self) -> ParsedAnswer<'_> {
        ParsedAnswer::parse(&self.content)
    }
}

/// One increment of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub sources: Vec<Source>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty) && self.sources.is_empty()
    }
}

/// An assistant answer split at the verbatim record marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedAnswer<'a> {
    /// Everything before the marker, untrimmed.
    pub answer: &'a str,
    /// The quoted record after the marker, if present.
    pub verbatim: Option<&'a str>,
}

impl<'a> ParsedAnswer<'a> {
    pub fn parse(content: &'a str) -> Self {
        match content.split_once(VERBATIM_MARKER) {
            Some((answer, rest)) => {
                let verbatim = rest
                    .trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
                    .trim_end();
                Self {
                    answer,
                    verbatim: Some(verbatim),
                }
            }
            None => Self {
                answer: content,
                verbatim: None,
            },
        }
    }

    /// The identifier on the `Fatwa ID:` line of the verbatim block.
    pub fn fatwa_id(&self) -> Option<&'a str> {
        let verbatim = self.verbatim?;
        let (_, after) = verbatim.split_once(FATWA_ID_LABEL)?;
        let id = after.lines().next().unwrap_or("").trim();
        (!id.is_empty()).then_some(id)
    }

    /// The part of the answer that is read aloud.
    pub fn spoken_text(&self) -> &'a str {
        self.answer.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_marker() {
        let content = "Salah requires wudu and OFFICIAL VERBATIM RECORD: Darul Ifta\nFatwa ID: 123\nExact text.";
        let parsed = ParsedAnswer::parse(content);
        assert_eq!(parsed.answer, "Salah requires wudu and ");
        assert_eq!(parsed.verbatim, Some("Darul Ifta\nFatwa ID: 123\nExact text."));
        assert_eq!(parsed.fatwa_id(), Some("123"));
        assert_eq!(parsed.spoken_text(), "Salah requires wudu and");
    }

    #[test]
    fn parse_strips_leading_dashes_and_colons() {
        let parsed = ParsedAnswer::parse("Yes.\nOFFICIAL VERBATIM RECORD\n-- : Institute\nFatwa ID:  A-77 \n\"Quote\"\n");
        assert_eq!(parsed.verbatim, Some("Institute\nFatwa ID:  A-77 \n\"Quote\""));
        assert_eq!(parsed.fatwa_id(), Some("A-77"));
    }

    #[test]
    fn parse_without_marker_is_all_answer() {
        let parsed = ParsedAnswer::parse("Plain answer.");
        assert_eq!(parsed.answer, "Plain answer.");
        assert_eq!(parsed.verbatim, None);
        assert_eq!(parsed.fatwa_id(), None);
    }

    #[test]
    fn missing_fatwa_id_value_is_none() {
        let parsed = ParsedAnswer::parse("a OFFICIAL VERBATIM RECORD: X\nFatwa ID:\nquote");
        assert_eq!(parsed.fatwa_id(), None);
    }

    #[test]
    fn chunk_emptiness() {
        assert!(StreamChunk::default().is_empty());
        assert!(StreamChunk::text("").is_empty());
        assert!(!StreamChunk::text("a").is_empty());
        assert!(!StreamChunk::default()
            .with_sources(vec![Source::new("t", "u")])
            .is_empty());
    }

    #[test]
    fn reply_ref_truncates_by_chars() {
        let msg = Message::user("میں ٹھیک ہوں");
        let reply = msg.reply_ref(3);
        assert_eq!(reply.snippet, "میں");
        assert_eq!(reply.role, Role::User);
        assert_eq!(reply.id, msg.id);
    }
}
