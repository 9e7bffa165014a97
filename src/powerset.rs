use crate::circularity::CircularityError;

/// Every non-empty subset of `features`, by increasing size and, within a
/// size, in lexicographic order of the subset's indices into the sorted list.
///
/// Features are sorted (and must be distinct) before enumeration, so each
/// combination lists its features in sorted order.
pub fn feature_powerset(features: &[String]) -> Result<Vec<Vec<String>>, CircularityError> {
    if features.is_empty() {
        return Err(CircularityError::InvalidInput(
            "cannot enumerate combinations of an empty feature set".to_string(),
        ));
    }
    let mut sorted = features.to_vec();
    sorted.sort();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(CircularityError::InvalidInput(
            "feature names must be distinct".to_string(),
        ));
    }
    let n = sorted.len();
    if n >= usize::BITS as usize {
        return Err(CircularityError::InvalidInput(format!(
            "{n} features yield more combinations than can be enumerated"
        )));
    }

    let mut combinations = Vec::with_capacity((1usize << n) - 1);
    for size in 1..=n {
        let mut idx: Vec<usize> = (0..size).collect();
        loop {
            combinations.push(idx.iter().map(|&i| sorted[i].clone()).collect());
            // Advance the rightmost index that still has room.
            let Some(pivot) = (0..size).rev().find(|&i| idx[i] != i + n - size) else {
                break;
            };
            idx[pivot] += 1;
            for j in pivot + 1..size {
                idx[j] = idx[j - 1] + 1;
            }
        }
    }
    Ok(combinations)
}
