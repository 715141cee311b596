// Set and string distance primitives shared by the scoring dimensions.
#![allow(clippy::cast_precision_loss)]

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;

/// Lowercase alphanumeric tokens longer than two characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// `|a ∩ b| / |a ∪ b|`; two empty sets are identical.
pub fn jaccard<T: Ord + Hash>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Edit distance over `char`s, two-row dynamic programming.
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - distance / max_len`, 1.0 for two empty strings.
pub fn edit_similarity(a: &[char], b: &[char]) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Shared leading segments over the longer path's length.
pub fn common_prefix_ratio(a: &[String], b: &[String]) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    common as f64 / max_len as f64
}

/// `min / max` of two counts; two zeros are identical.
pub fn count_closeness(a: u64, b: u64) -> f64 {
    let max = a.max(b);
    if max == 0 {
        return 1.0;
    }
    a.min(b) as f64 / max as f64
}

/// Query similarity: half key overlap, half exact value matches over all keys.
pub fn query_similarity(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let keys_a: BTreeSet<&String> = a.keys().collect();
    let keys_b: BTreeSet<&String> = b.keys().collect();
    let union = keys_a.union(&keys_b).count();
    let matching_values = a
        .iter()
        .filter(|(k, v)| b.get(*k).is_some_and(|other| other == *v))
        .count();
    0.5 * jaccard(&keys_a, &keys_b) + 0.5 * (matching_values as f64 / union as f64)
}
