//! Extended M3U parsing
//!
//! A playlist is a header line followed by entries. An entry is a `#EXTINF`
//! metadata line, any number of further tag lines (`#EXTVLCOPT:...` and
//! friends, kept verbatim), then one stream URL line.
//!
//! [`segments`] splits the text into entries without copying, so text level
//! filters can drop whole entries and reproduce everything else verbatim.
//! [`parse_entries`] builds on it and yields owned [`ParsedEntry`] values.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const UNKNOWN_NAME: &str = "<UNKNOWN>";
pub const NO_GROUP: &str = "<NONE>";

const METADATA_TAG: &str = "#EXTINF";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEntry {
    pub name: String,
    pub logo: Option<String>,
    pub group: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    /// Tag lines between metadata and URL, newline joined, empty when none
    pub extra_tag_lines: String,
    pub stream_url: String,
}

/// The lines of one complete entry, borrowed from the playlist text
#[derive(Debug, Clone)]
pub struct PlaylistBlock<'a> {
    pub metadata: &'a str,
    pub tag_lines: Vec<&'a str>,
    pub url: &'a str,
    /// Every original line of the entry, blank ones included
    pub raw: Vec<&'a str>,
}

impl<'a> PlaylistBlock<'a> {
    pub fn attributes(&self) -> Metadata {
        parse_metadata(self.metadata)
    }
}

#[derive(Debug, Clone)]
pub enum Segment<'a> {
    /// A line outside any entry: header, blanks, stray comments or URLs
    Other(&'a str),
    Entry(PlaylistBlock<'a>),
    /// Metadata (and tags) never followed by a URL
    Dangling(Vec<&'a str>),
}

struct PendingBlock<'a> {
    metadata: &'a str,
    tag_lines: Vec<&'a str>,
    raw: Vec<&'a str>,
}

impl<'a> PendingBlock<'a> {
    fn new(metadata: &'a str) -> Self {
        Self {
            metadata,
            tag_lines: Vec::new(),
            raw: vec![metadata],
        }
    }
}

/// Lazy splitter over playlist text
pub struct Segments<'a> {
    lines: std::str::Lines<'a>,
    pending: Option<PendingBlock<'a>>,
}

pub fn segments(text: &str) -> Segments<'_> {
    Segments {
        lines: text.lines(),
        pending: None,
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(line) = self.lines.next() else {
                return self.pending.take().map(|p| Segment::Dangling(p.raw));
            };
            let trimmed = line.trim();

            if trimmed.starts_with(METADATA_TAG) {
                if let Some(previous) = self.pending.replace(PendingBlock::new(line)) {
                    return Some(Segment::Dangling(previous.raw));
                }
                continue;
            }

            let Some(pending) = self.pending.as_mut() else {
                return Some(Segment::Other(line));
            };

            if trimmed.is_empty() {
                pending.raw.push(line);
                continue;
            }
            if trimmed.starts_with('#') {
                pending.tag_lines.push(line);
                pending.raw.push(line);
                continue;
            }

            let mut block = self.pending.take()?;
            block.raw.push(line);
            return Some(Segment::Entry(PlaylistBlock {
                metadata: block.metadata,
                tag_lines: block.tag_lines,
                url: line,
                raw: block.raw,
            }));
        }
    }
}

/// Attributes and display name of a `#EXTINF` line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub name: Option<String>,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub logo: Option<String>,
    pub group: Option<String>,
}

/// Parse `#EXTINF:-1 key="value" ...,Display Name`.
///
/// The display name starts after the first comma outside a quoted
/// attribute value, so names may contain commas. Empty values are absent.
pub fn parse_metadata(line: &str) -> Metadata {
    let body = line
        .trim()
        .strip_prefix(METADATA_TAG)
        .map(|rest| rest.strip_prefix(':').unwrap_or(rest))
        .unwrap_or(line);

    let mut in_quotes = false;
    let mut split_at = None;
    for (idx, ch) in body.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                split_at = Some(idx);
                break;
            }
            _ => {}
        }
    }

    let (attributes, name) = match split_at {
        Some(idx) => (&body[..idx], Some(body[idx + 1..].trim())),
        None => (body, None),
    };

    let mut metadata = Metadata {
        name: name.filter(|n| !n.is_empty()).map(str::to_string),
        ..Default::default()
    };

    for (key, value) in parse_attributes(attributes) {
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "tvg-id" => metadata.tvg_id = Some(value),
            "tvg-name" => metadata.tvg_name = Some(value),
            "tvg-logo" => metadata.logo = Some(value),
            "group-title" => metadata.group = Some(value),
            _ => {}
        }
    }

    metadata
}

fn parse_attributes(attributes: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current_key = String::new();
    let mut current_value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;

    for ch in attributes.chars() {
        match ch {
            '"' if in_value => in_quotes = !in_quotes,
            '=' if !in_quotes && !in_value => in_value = true,
            ' ' | '\t' if !in_quotes => {
                if in_value {
                    attrs.push((current_key.trim().to_string(), current_value.clone()));
                    in_value = false;
                }
                current_key.clear();
                current_value.clear();
            }
            _ => {
                if in_value {
                    current_value.push(ch);
                } else {
                    current_key.push(ch);
                }
            }
        }
    }

    if in_value {
        attrs.push((current_key.trim().to_string(), current_value));
    }

    attrs
}

impl<'a> From<PlaylistBlock<'a>> for ParsedEntry {
    fn from(block: PlaylistBlock<'a>) -> Self {
        let metadata = block.attributes();
        let name = metadata.name.unwrap_or_else(|| {
            warn!("Entry without display name: {}", block.metadata.trim());
            UNKNOWN_NAME.to_string()
        });

        ParsedEntry {
            name,
            logo: metadata.logo,
            group: metadata.group.unwrap_or_else(|| NO_GROUP.to_string()),
            tvg_id: metadata.tvg_id,
            tvg_name: metadata.tvg_name,
            extra_tag_lines: block.tag_lines.join("\n"),
            stream_url: block.url.trim().to_string(),
        }
    }
}

/// Lazy, restartable sequence of entries: calling this again over the same
/// text starts from the beginning.
pub fn parse_entries(text: &str) -> impl Iterator<Item = ParsedEntry> + '_ {
    segments(text).filter_map(|segment| match segment {
        Segment::Entry(block) => Some(ParsedEntry::from(block)),
        Segment::Dangling(lines) => {
            warn!("Discarding metadata without stream URL: {}", lines[0].trim());
            None
        }
        Segment::Other(line) => {
            let trimmed = line.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                warn!("Skipping stream URL without metadata: {}", trimmed);
            } else if !trimmed.is_empty() {
                debug!("Ignoring tag outside entry: {}", trimmed);
            }
            None
        }
    })
}
