//! Running transcript of both speakers.
//!
//! Consecutive fragments from the same speaker extend the current entry until
//! the entry is sealed (turn complete, interruption) or the other speaker talks.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Model,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "User"),
            Speaker::Model => write!(f, "Model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Whether the next fragment from `speaker` may still be merged in.
    pub appendable: bool,
}

#[derive(Debug, Default, Clone)]
pub struct TranscriptAggregator {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fragment. Fragments are trimmed and joined with a single space;
    /// blank fragments are ignored. Returns true if the transcript changed.
    pub fn append(&mut self, speaker: Speaker, fragment: &str) -> bool {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return false;
        }
        match self.entries.last_mut() {
            Some(last) if last.speaker == speaker && last.appendable => {
                last.text.push(' ');
                last.text.push_str(fragment);
            }
            _ => self.entries.push(TranscriptEntry {
                speaker,
                text: fragment.to_string(),
                appendable: true,
            }),
        }
        true
    }

    /// Close the current entry; the next fragment starts a new one.
    pub fn seal(&mut self) {
        if let Some(last) = self.entries.last_mut() {
            last.appendable = false;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `Speaker: text` line per entry.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.speaker, e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
