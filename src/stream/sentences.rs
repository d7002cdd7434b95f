//! Sentence splitting for incremental speech/notification side effects.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How accumulated content is cut into segments.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Split after `.`, `!` or `?` followed by whitespace.
    #[default]
    Punctuation,
    /// Split on line breaks.
    Paragraphs,
    /// Never split; the whole content is one segment.
    None,
}

/// Splits message content into speakable segments.
#[derive(Clone, Debug)]
pub struct SentenceSplitter {
    policy: SplitPolicy,
    code_block: Regex,
    sentence_end: Regex,
    paragraph_break: Regex,
}

impl SentenceSplitter {
    /// Build a splitter for `policy`.
    ///
    /// # Errors
    /// Returns an error if a pattern fails to compile.
    pub fn new(policy: SplitPolicy) -> Result<Self, regex::Error> {
        Ok(Self {
            policy,
            code_block: Regex::new(r"(?s)```.*?```")?,
            sentence_end: Regex::new(r"[.!?]\s+")?,
            paragraph_break: Regex::new(r"\n+")?,
        })
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> SplitPolicy {
        self.policy
    }

    /// Split `content` into trimmed, non-empty segments.
    ///
    /// Fenced code blocks are dropped; the last segment may still be incomplete.
    #[must_use]
    pub fn parts(&self, content: &str) -> Vec<String> {
        let text = self.code_block.replace_all(content, " ");
        let pieces: Vec<&str> = match self.policy {
            SplitPolicy::Punctuation => {
                let mut pieces = Vec::new();
                let mut start = 0;
                for found in self.sentence_end.find_iter(&text) {
                    // keep the punctuation mark, drop the whitespace
                    pieces.push(&text[start..=found.start()]);
                    start = found.end();
                }
                pieces.push(&text[start..]);
                pieces
            }
            SplitPolicy::Paragraphs => self.paragraph_break.split(&text).collect(),
            SplitPolicy::None => vec![text.as_ref()],
        };
        pieces
            .into_iter()
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Remembers the last dispatched segment of one response.
#[derive(Clone, Debug, Default)]
pub struct SentenceTracker {
    last_dispatched: Option<String>,
}

impl SentenceTracker {
    /// Start tracking with an already dispatched segment (e.g. when continuing).
    #[must_use]
    pub const fn with_last(last_dispatched: Option<String>) -> Self {
        Self { last_dispatched }
    }

    /// Newest complete segment of `content`, if it has not been dispatched yet.
    ///
    /// The trailing segment is treated as incomplete while streaming.
    pub fn observe(&mut self, splitter: &SentenceSplitter, content: &str) -> Option<String> {
        let mut parts = splitter.parts(content);
        parts.pop();
        self.dispatch(parts.pop())
    }

    /// Final segment once the stream has ended, if not dispatched yet.
    pub fn finish(&mut self, splitter: &SentenceSplitter, content: &str) -> Option<String> {
        let mut parts = splitter.parts(content);
        self.dispatch(parts.pop())
    }

    /// Last dispatched segment.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.last_dispatched.as_deref()
    }

    fn dispatch(&mut self, candidate: Option<String>) -> Option<String> {
        let candidate = candidate?;
        if self.last_dispatched.as_deref() == Some(candidate.as_str()) {
            return None;
        }
        self.last_dispatched = Some(candidate.clone());
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(policy: SplitPolicy) -> SentenceSplitter {
        SentenceSplitter::new(policy).unwrap()
    }

    #[test]
    fn punctuation_split_keeps_marks() {
        let parts = splitter(SplitPolicy::Punctuation).parts("Hi there. How are you? Fine");
        assert_eq!(parts, vec!["Hi there.", "How are you?", "Fine"]);
    }

    #[test]
    fn code_blocks_are_ignored() {
        let parts = splitter(SplitPolicy::Punctuation)
            .parts("Look. ```rust\nfn main() { a. b }\n``` Done.");
        assert_eq!(parts, vec!["Look.", "Done."]);
    }

    #[test]
    fn paragraph_split() {
        let parts = splitter(SplitPolicy::Paragraphs).parts("one. two\n\nthree");
        assert_eq!(parts, vec!["one. two", "three"]);
    }

    #[test]
    fn tracker_emits_each_sentence_once() {
        let splitter = splitter(SplitPolicy::Punctuation);
        let mut tracker = SentenceTracker::default();

        assert_eq!(tracker.observe(&splitter, "Hello"), None);
        assert_eq!(tracker.observe(&splitter, "Hello world. Next"), Some("Hello world.".into()));
        assert_eq!(tracker.observe(&splitter, "Hello world. Next one"), None);
        assert_eq!(
            tracker.observe(&splitter, "Hello world. Next one! And"),
            Some("Next one!".into())
        );
        assert_eq!(tracker.finish(&splitter, "Hello world. Next one! And"), Some("And".into()));
        assert_eq!(tracker.finish(&splitter, "Hello world. Next one! And"), None);
    }

    #[test]
    fn no_split_policy_only_finishes() {
        let splitter = splitter(SplitPolicy::None);
        let mut tracker = SentenceTracker::default();
        assert_eq!(tracker.observe(&splitter, "A. B. C"), None);
        assert_eq!(tracker.finish(&splitter, "A. B. C"), Some("A. B. C".into()));
    }
}
