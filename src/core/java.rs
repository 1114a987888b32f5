use std::cmp::Ordering;
use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Bitness {
    Bits64,
    Bits32,
    Unknown,
}

impl Bitness {
    fn rank(self) -> u8 {
        match self {
            Bitness::Bits64 => 0,
            Bitness::Bits32 => 1,
            Bitness::Unknown => 2,
        }
    }
}

/// A runtime found by one scan. Never cached between scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCandidate {
    pub path: PathBuf,
    pub version: String,
    pub bitness: Bitness,
}

/// Newest version first; equal versions prefer 64-bit, then the lower path.
pub(crate) fn rank_candidates(candidates: &mut [RuntimeCandidate]) {
    candidates.sort_by(|a, b| {
        compare_versions(&b.version, &a.version)
            .then_with(|| a.bitness.rank().cmp(&b.bitness.rank()))
            .then_with(|| a.path.cmp(&b.path))
    });
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Number(u64),
    Text(&'a str),
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    version
        .split(['.', '_', '-', '+'])
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<u64>() {
            Ok(number) => Segment::Number(number),
            Err(_) => Segment::Text(part),
        })
        .collect()
}

/// Compares version strings segment by segment. Numeric segments compare as
/// integers and sort above textual ones; a version that extends another
/// sorts above it.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = segments(left);
    let right = segments(right);
    for (a, b) in left.iter().zip(right.iter()) {
        let ordering = match (a, b) {
            (Segment::Number(a), Segment::Number(b)) => a.cmp(b),
            (Segment::Number(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Less,
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}
