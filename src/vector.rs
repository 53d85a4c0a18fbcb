//! Dense vector helpers shared by the index builder and the search engine.

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale `v` to unit L2 norm in place.
///
/// Returns `false` (leaving `v` untouched) when the vector has zero norm or
/// contains non-finite values, since no direction can be recovered.
pub fn normalize(v: &mut [f32]) -> bool {
    if v.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut v = vec![0.2, -0.5, 0.7, 0.1];
        assert!(normalize(&mut v));
        let once = v.clone();
        assert!(normalize(&mut v));
        for (a, b) in once.iter().zip(&v) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_vector_is_rejected() {
        let mut v = vec![0.0; 4];
        assert!(!normalize(&mut v));
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn non_finite_vector_is_rejected() {
        let mut v = vec![1.0, f32::NAN];
        assert!(!normalize(&mut v));
    }

    #[test]
    fn dot_of_orthogonal_vectors_is_zero() {
        assert_eq!(dot(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }
}
