use std::collections::HashMap;

/// Cosine similarity for f32 embedding vectors. Zero vectors and mismatched
/// dimensions score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine similarity over sparse feature maps.
pub fn sparse_cosine(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f32 = small
        .iter()
        .filter_map(|(k, v)| large.get(k).map(|w| v * w))
        .sum();
    let norm_a: f32 = a.values().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Running mean of member vectors, used as a cluster centroid.
#[derive(Debug, Clone)]
pub struct Centroid {
    sum: Vec<f32>,
    count: usize,
}

impl Centroid {
    pub fn new(first: &[f32]) -> Self {
        Self {
            sum: first.to_vec(),
            count: 1,
        }
    }

    pub fn add(&mut self, vector: &[f32]) {
        if vector.len() != self.sum.len() {
            return;
        }
        for (s, v) in self.sum.iter_mut().zip(vector) {
            *s += v;
        }
        self.count += 1;
    }

    /// Cosine against the mean (scale-invariant, so the sum is enough).
    pub fn similarity(&self, vector: &[f32]) -> f32 {
        cosine_similarity(&self.sum, vector)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_and_degenerate_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn sparse_cosine_ignores_missing_features() {
        let a = HashMap::from([("out:director".to_string(), 1.0), ("in_degree".to_string(), 2.0)]);
        let b = HashMap::from([("out:director".to_string(), 1.0), ("in_degree".to_string(), 2.0)]);
        let c = HashMap::from([("out:award".to_string(), 1.0)]);
        assert!((sparse_cosine(&a, &b) - 1.0).abs() < 1e-6);
        assert_eq!(sparse_cosine(&a, &c), 0.0);
    }

    #[test]
    fn centroid_tracks_members() {
        let mut c = Centroid::new(&[1.0, 0.0]);
        c.add(&[0.0, 1.0]);
        assert_eq!(c.len(), 2);
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((c.similarity(&[1.0, 0.0]) - expected).abs() < 1e-6);
    }
}
