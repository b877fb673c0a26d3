use crate::ingestor::m3u_parser::{segments, Segment};
use crate::models::FilterMode;

/// Channel-name filter of a downstream playlist. Matching entries are
/// removed regardless of their group; only the display name is compared.
#[derive(Debug, Clone)]
pub struct ChannelNameFilter {
    mode: FilterMode,
    patterns: Vec<String>,
}

impl ChannelNameFilter {
    pub fn new(mode: FilterMode, patterns: Vec<String>) -> Self {
        let patterns = patterns.into_iter().filter(|p| !p.is_empty()).collect();
        Self { mode, patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| match self.mode {
            FilterMode::Any => name.contains(pattern.as_str()),
            FilterMode::Exact => name == pattern,
            FilterMode::Prefix => name.starts_with(pattern.as_str()),
            FilterMode::Suffix => name.ends_with(pattern.as_str()),
        })
    }

    /// Remove every entry whose display name matches; other lines are kept
    /// verbatim
    pub fn apply(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }

        let mut output = String::with_capacity(text.len());
        for segment in segments(text) {
            let lines = match segment {
                Segment::Other(line) => vec![line],
                Segment::Dangling(lines) => lines,
                Segment::Entry(block) => {
                    let name = block.attributes().name.unwrap_or_default();
                    if self.matches(&name) {
                        continue;
                    }
                    block.raw
                }
            };
            for line in lines {
                output.push_str(line);
                output.push('\n');
            }
        }
        output
    }
}
