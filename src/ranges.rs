//! Integer revision-range arithmetic: union, subtract, parse, render (§2 Ranges).
//!
//! Ported from the original tool's `rev_ranges.py`: ranges are inclusive
//! `(start, end)` pairs, kept sorted and merged so adjacent/overlapping
//! ranges collapse into one (the canonical form spec §8 tests against).

use crate::errors::{ConvertError, Result};

/// An inclusive revision range `[start, end]`.
pub type Range = (u64, u64);

/// A canonicalised, sorted, non-overlapping list of inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranges(Vec<Range>);

impl Ranges {
    pub fn new() -> Self {
        Ranges(Vec::new())
    }

    pub fn from_sorted(ranges: Vec<Range>) -> Self {
        Ranges(sort_ranges(ranges))
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `rev` falls within any contained range.
    pub fn contains(&self, rev: u64) -> bool {
        rev_in_ranges(&self.0, rev)
    }

    /// Union of `self` and `other`, canonicalised.
    pub fn combine(&self, other: &Ranges) -> Ranges {
        let mut combined = self.0.clone();
        combined.extend_from_slice(&other.0);
        Ranges(sort_ranges(combined))
    }

    /// `self` with every revision in `other` removed.
    pub fn subtract(&self, other: &Ranges) -> Ranges {
        Ranges(subtract_ranges(&self.0, &other.0))
    }

    pub fn parse(src: &str) -> Result<Ranges> {
        Ok(Ranges(str_to_ranges(src)?))
    }

    pub fn render(&self) -> String {
        ranges_to_str(&self.0)
    }
}

fn rev_in_ranges(ranges: &[Range], rev: u64) -> bool {
    ranges.iter().any(|&(start, end)| rev >= start && rev <= end)
}

/// Sort by start, then merge overlapping/adjacent ranges.
fn sort_ranges(mut ranges: Vec<Range>) -> Vec<Range> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort();

    let mut prev_start: Option<u64> = None;
    let mut prev_end: Option<u64> = None;
    let mut result: Vec<Range> = Vec::new();

    for (start, end) in ranges {
        if let Some(pe) = prev_end {
            if end <= pe {
                continue;
            }
        }
        if let (Some(ps), Some(pe)) = (prev_start, prev_end) {
            if start <= pe + 1 {
                let last = result.last_mut().expect("prev_start implies a pushed range");
                *last = (ps, end);
                prev_end = Some(end);
                continue;
            }
        }
        prev_start = Some(start);
        result.push((start, end));
        prev_end = Some(end);
    }

    result
}

fn ranges_to_str(ranges: &[Range]) -> String {
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else if start + 1 == end {
                format!("{start},{end}")
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn subtract_ranges(current: &[Range], prev: &[Range]) -> Vec<Range> {
    if prev.is_empty() {
        return current.to_vec();
    }

    let mut result = Vec::new();
    for &(mut start, end) in current {
        for &(sub_start, sub_end) in prev {
            if sub_start > end {
                break;
            }
            if sub_end < start {
                continue;
            }
            if sub_start <= start {
                start = sub_end + 1;
                continue;
            }
            result.push((start, sub_start - 1));
            start = sub_end + 1;
        }
        if end >= start {
            result.push((start, end));
        }
    }
    result
}

fn str_to_ranges(src: &str) -> Result<Vec<Range>> {
    let mut ranges = Vec::new();
    if src.is_empty() {
        return Ok(ranges);
    }

    for part in src.split(',') {
        let part = part.trim();
        let (start_s, end_s) = match part.split_once('-') {
            Some((s, e)) => (s, e),
            None => (part, part),
        };
        let start: u64 = start_s
            .parse()
            .map_err(|_| ConvertError::ParseError(format!("invalid range component: `{part}`")))?;
        let end: u64 = end_s
            .parse()
            .map_err(|_| ConvertError::ParseError(format!("invalid range component: `{part}`")))?;
        if end < start {
            return Err(ConvertError::ParseError(format!(
                "invalid range, end < start: `{part}`"
            )));
        }
        ranges.push((start, end));
    }

    Ok(sort_ranges(ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, quickcheck};

    #[test]
    fn test_parse_render_roundtrip() {
        let r = Ranges::parse("1,3-5,8").unwrap();
        assert_eq!(r.render(), "1,3-5,8");
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let r = Ranges::parse("1-2,3-5").unwrap();
        assert_eq!(r.render(), "1-5");
    }

    #[test]
    fn test_two_adjacent_singles_render_as_pair() {
        let r = Ranges::parse("4,5").unwrap();
        assert_eq!(r.render(), "4,5");
    }

    #[test]
    fn test_subtract_self_is_empty() {
        let r = Ranges::parse("1-10").unwrap();
        assert!(r.subtract(&r).is_empty());
    }

    #[test]
    fn test_subtract_middle_splits_range() {
        let r = Ranges::parse("1-10").unwrap();
        let cut = Ranges::parse("4-6").unwrap();
        assert_eq!(r.subtract(&cut).render(), "1-3,7-10");
    }

    #[test]
    fn test_combine_commutes() {
        let a = Ranges::parse("1-3,9").unwrap();
        let b = Ranges::parse("4-5,20").unwrap();
        assert_eq!(a.combine(&b), b.combine(&a));
    }

    #[test]
    fn test_contains() {
        let r = Ranges::parse("1-3,9").unwrap();
        assert!(r.contains(2));
        assert!(r.contains(9));
        assert!(!r.contains(5));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Ranges::parse("abc").is_err());
        assert!(Ranges::parse("5-2").is_err());
    }

    #[derive(Clone, Debug)]
    struct SmallRanges(Vec<Range>);

    impl Arbitrary for SmallRanges {
        fn arbitrary(g: &mut Gen) -> Self {
            let n = usize::arbitrary(g) % 6;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                let start = u64::arbitrary(g) % 50;
                let len = u64::arbitrary(g) % 5;
                v.push((start, start + len));
            }
            SmallRanges(v)
        }
    }

    quickcheck! {
        fn prop_render_parse_roundtrip(sr: SmallRanges) -> bool {
            let ranges = Ranges::from_sorted(sr.0);
            let rendered = ranges.render();
            let reparsed = Ranges::parse(&rendered).unwrap_or_else(|_| Ranges::new());
            reparsed == ranges
        }

        fn prop_subtract_self_empty(sr: SmallRanges) -> bool {
            let ranges = Ranges::from_sorted(sr.0);
            ranges.subtract(&ranges).is_empty()
        }

        fn prop_combine_commutative(a: SmallRanges, b: SmallRanges) -> bool {
            let ra = Ranges::from_sorted(a.0);
            let rb = Ranges::from_sorted(b.0);
            ra.combine(&rb) == rb.combine(&ra)
        }
    }
}
