//! Core id list notation
//!
//! Host core sets are written as comma separated ids and inclusive ranges,
//! e.g. `"0-3,8"`. Malformed elements are skipped with a warning rather than
//! failing the whole list.

use std::collections::BTreeSet;

use tracing::warn;

/// Set of host core ids, always kept sorted
pub type CoreSet = BTreeSet<u32>;

/// Parse one element into an inclusive `(start, end)` span.
fn parse_element(element: &str) -> Option<(u32, u32)> {
    match element.split_once('-') {
        Some((start, end)) => {
            let start = match start.trim().parse::<u32>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Invalid core range start: {}", start);
                    return None;
                }
            };
            let end = match end.trim().parse::<u32>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Invalid core range end: {}", end);
                    return None;
                }
            };
            if start > end {
                warn!("Invalid core range (start > end): {}", element);
                return None;
            }
            Some((start, end))
        }
        None => match element.trim().parse::<u32>() {
            Ok(id) => Some((id, id)),
            Err(_) => {
                warn!("Invalid core ID: {}", element);
                None
            }
        },
    }
}

fn spans(range: &str) -> impl Iterator<Item = (u32, u32)> + '_ {
    range
        .split(',')
        .filter(|element| !element.trim().is_empty())
        .filter_map(parse_element)
}

/// Parse a core list into a set of ids.
pub fn parse(range: &str) -> CoreSet {
    spans(range).flat_map(|(start, end)| start..=end).collect()
}

/// Format a set of core ids, merging consecutive runs.
///
/// The result is canonical: ascending, deduplicated, runs collapsed to
/// `start-end`, singletons printed bare.
pub fn format<I>(cores: I) -> String
where
    I: IntoIterator<Item = u32>,
{
    let sorted: CoreSet = cores.into_iter().collect();
    let mut runs: Vec<(u32, u32)> = Vec::new();

    for id in sorted {
        match runs.last_mut() {
            Some((_, end)) if id == *end + 1 => *end = id,
            _ => runs.push((id, id)),
        }
    }

    runs.iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Count the ids in a core list without materialising it.
///
/// Sums the width of every element, so overlapping elements are counted
/// once per occurrence.
pub fn count(range: &str) -> usize {
    spans(range)
        .map(|(start, end)| (end - start) as usize + 1)
        .sum()
}
