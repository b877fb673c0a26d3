//! Removal of excluded groups from raw playlist text
//!
//! Exclusions are literal group titles compared for exact equality with each
//! entry's `group-title`. Operator text is never interpreted as a pattern.

use std::collections::HashSet;

use super::m3u_parser::{segments, Segment};

/// Drop every entry whose group title is in `exclusions`; all other lines
/// are reproduced verbatim. The result does not depend on exclusion order.
pub fn filter_groups<S: AsRef<str>>(text: &str, exclusions: &[S]) -> String {
    let excluded: HashSet<&str> = exclusions
        .iter()
        .map(|e| e.as_ref().trim_end_matches('\r'))
        .filter(|e| !e.is_empty())
        .collect();

    let mut output = String::with_capacity(text.len());
    let mut push = |line: &str| {
        output.push_str(line);
        output.push('\n');
    };

    for segment in segments(text) {
        match segment {
            Segment::Other(line) => push(line),
            Segment::Dangling(lines) => lines.into_iter().for_each(&mut push),
            Segment::Entry(block) => {
                let group = block.attributes().group;
                let drop = group.as_deref().is_some_and(|g| excluded.contains(g));
                if !drop {
                    block.raw.into_iter().for_each(&mut push);
                }
            }
        }
    }

    output
}
