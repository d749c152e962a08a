//! Collapses authored field shapes into non-empty candidate arrays.
//!
//! An absent field becomes a single unset candidate, so it never shrinks the
//! cross-product. An authored empty array is kept as-is.

use std::path::Path;

use anyhow::Result;
use sdbatch_contracts::config::{Candidates, SeedSpec, Toggle};

use crate::files::ImageFiles;

pub fn normalize<T: Clone>(value: Option<&Candidates<T>>, default: T) -> Vec<T> {
    match value {
        Some(candidates) => candidates.to_vec(),
        None => vec![default],
    }
}

/// [`normalize`] with an unset default.
pub fn optional<T: Clone>(value: Option<&Candidates<T>>) -> Vec<Option<T>> {
    match value {
        Some(candidates) => candidates.to_vec().into_iter().map(Some).collect(),
        None => vec![None],
    }
}

pub fn toggle(value: Option<Toggle>) -> Vec<bool> {
    match value {
        Some(Toggle::Both(_)) => vec![true, false],
        Some(Toggle::Flag(flag)) => vec![flag],
        None => vec![false],
    }
}

pub fn seeds(value: Option<&SeedSpec>) -> Vec<Option<i64>> {
    match value {
        None => vec![None],
        Some(SeedSpec::One(seed)) => vec![Some(*seed)],
        Some(SeedSpec::Many(seeds)) => seeds.iter().copied().map(Some).collect(),
        Some(SeedSpec::Range(raw)) => seed_range(raw),
    }
}

/// Inclusive `"first-last"` range. A bare number is a one-seed range.
pub fn seed_range(raw: &str) -> Vec<Option<i64>> {
    let raw = raw.trim();
    let bounds = match raw.get(1..).and_then(|rest| rest.find('-')) {
        Some(split) => {
            let (first, last) = raw.split_at(split + 1);
            (first.trim().parse::<i64>(), last[1..].trim().parse::<i64>())
        }
        None => match raw.parse::<i64>() {
            Ok(seed) => return vec![Some(seed)],
            Err(_) => return vec![None],
        },
    };
    match bounds {
        (Ok(first), Ok(last)) if last >= first => (first..=last).map(Some).collect(),
        _ => vec![None],
    }
}

/// Image candidates; directories expand to their files in enumeration order.
///
/// A directory without files is reported in `notices`. When nothing at all is
/// found the field stays unset instead of emptying the axis.
pub fn images(
    files: &dyn ImageFiles,
    value: Option<&Candidates<String>>,
    notices: &mut Vec<String>,
) -> Result<Vec<Option<String>>> {
    let Some(candidates) = value else {
        return Ok(vec![None]);
    };
    let candidates = candidates.to_vec();
    let mut out = Vec::new();
    for candidate in &candidates {
        let path = Path::new(candidate);
        if !files.is_directory(path) {
            out.push(Some(candidate.clone()));
            continue;
        }
        let before = out.len();
        for entry in files.list_directory(path)? {
            if entry.is_dir {
                continue;
            }
            out.push(Some(entry.path.to_string_lossy().to_string()));
        }
        if out.len() == before {
            notices.push(format!("initImage directory '{candidate}' has no files"));
        }
    }
    if out.is_empty() && !candidates.is_empty() {
        out.push(None);
    }
    Ok(out)
}
