//! Embedding arithmetic shared by the cluster engine and the lifecycle tracker.

/// Cosine similarity in `[-1, 1]`. Mismatched lengths, empty input and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

/// Fold one more member into a running mean over `count` members.
///
/// An empty mean (`count <= 0`) takes the vector as is. Returns `false` and leaves the
/// centroid alone when a non-empty mean has a different dimension than `vector`.
#[must_use]
pub fn add_to_mean(centroid: &mut Vec<f32>, count: i64, vector: &[f32]) -> bool {
    if count <= 0 {
        centroid.clear();
        centroid.extend_from_slice(vector);
        return true;
    }
    if centroid.len() != vector.len() {
        return false;
    }
    let n = (count + 1) as f32;
    for (c, v) in centroid.iter_mut().zip(vector) {
        *c += (v - *c) / n;
    }
    true
}

/// Take one member out of a running mean over `count` members.
///
/// The last member leaves the centroid untouched so a dormant cluster keeps its position.
pub fn remove_from_mean(centroid: &mut [f32], count: i64, vector: &[f32]) {
    if count <= 1 || centroid.len() != vector.len() {
        return;
    }
    let n = count as f32;
    for (c, v) in centroid.iter_mut().zip(vector) {
        *c = (n * *c - v) / (n - 1.0);
    }
}

/// Exact mean of `vectors`; `None` when there is nothing to average or dimensions disagree.
pub fn mean<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut iter = vectors.into_iter();
    let first = iter.next()?;
    let mut sum: Vec<f64> = first.iter().map(|v| *v as f64).collect();
    let mut n = 1usize;
    for vector in iter {
        if vector.len() != sum.len() {
            return None;
        }
        for (s, v) in sum.iter_mut().zip(vector) {
            *s += *v as f64;
        }
        n += 1;
    }
    Some(sum.into_iter().map(|s| (s / n as f64) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn streaming_mean_matches_exact_mean() {
        let members = [vec![1.0, 0.0, 2.0], vec![0.0, 1.0, 4.0], vec![3.0, 1.0, 0.0]];
        let mut centroid = Vec::new();
        for (i, m) in members.iter().enumerate() {
            assert!(add_to_mean(&mut centroid, i as i64, m));
        }
        let exact = mean(members.iter().map(|m| m.as_slice())).expect("mean");
        assert!(close(&centroid, &exact));

        remove_from_mean(&mut centroid, 3, &members[2]);
        let exact = mean(members[..2].iter().map(|m| m.as_slice())).expect("mean");
        assert!(close(&centroid, &exact));
    }

    #[test]
    fn mismatched_dimensions_never_replace_a_populated_mean() {
        let mut centroid = vec![0.5, 0.5];
        assert!(!add_to_mean(&mut centroid, 2, &[1.0, 0.0, 0.0]));
        assert_eq!(centroid, vec![0.5, 0.5]);

        let mut empty = vec![0.5, 0.5];
        assert!(add_to_mean(&mut empty, 0, &[1.0, 0.0, 0.0]));
        assert_eq!(empty, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn removing_the_last_member_keeps_the_centroid() {
        let mut centroid = vec![0.5, 0.5];
        remove_from_mean(&mut centroid, 1, &[0.5, 0.5]);
        assert_eq!(centroid, vec![0.5, 0.5]);
        assert!(mean(std::iter::empty()).is_none());
    }
}
