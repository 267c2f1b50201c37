//! Vector similarity kernels.
//!
//! The retrieval path scores every indexed embedding against the query, so
//! the cosine kernel processes eight f32 products per iteration via
//! `wide::f32x8` with a scalar tail. `cosine_similarity_scalar` is the
//! reference implementation; the two must agree within 1e-4.

use wide::f32x8;

const LANES: usize = 8;

fn load8(slice: &[f32]) -> f32x8 {
    let mut lanes = [0.0f32; LANES];
    lanes.copy_from_slice(slice);
    f32x8::from(lanes)
}

fn finish_cosine(dot: f32, norm_a: f32, norm_b: f32) -> f32 {
    let magnitude_a = norm_a.sqrt();
    let magnitude_b = norm_b.sqrt();
    if magnitude_a < f32::EPSILON || magnitude_b < f32::EPSILON {
        return 0.0;
    }
    (dot / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0)
}

/// Cosine similarity of two equal-length vectors, in `[-1, 1]`.
///
/// Returns 0.0 when either input is empty or has near-zero magnitude.
/// Unequal non-empty lengths violate the session-wide dimension invariant;
/// callers (the vector index) validate dimensions before reaching here.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    assert_eq!(
        a.len(),
        b.len(),
        "embedding dimension mismatch: {} vs {}",
        a.len(),
        b.len()
    );

    let mut dot = f32x8::ZERO;
    let mut norm_a = f32x8::ZERO;
    let mut norm_b = f32x8::ZERO;

    let mut chunks_a = a.chunks_exact(LANES);
    let mut chunks_b = b.chunks_exact(LANES);
    for (ra, rb) in (&mut chunks_a).zip(&mut chunks_b) {
        let va = load8(ra);
        let vb = load8(rb);
        dot = va.mul_add(vb, dot);
        norm_a = va.mul_add(va, norm_a);
        norm_b = vb.mul_add(vb, norm_b);
    }

    let mut dot_sum = dot.reduce_add();
    let mut norm_a_sum = norm_a.reduce_add();
    let mut norm_b_sum = norm_b.reduce_add();

    for (&x, &y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
        dot_sum += x * y;
        norm_a_sum += x * x;
        norm_b_sum += y * y;
    }

    finish_cosine(dot_sum, norm_a_sum, norm_b_sum)
}

/// Scalar reference implementation of [`cosine_similarity`].
#[allow(dead_code)] // Exercised by the SIMD agreement tests
pub fn cosine_similarity_scalar(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    assert_eq!(
        a.len(),
        b.len(),
        "embedding dimension mismatch: {} vs {}",
        a.len(),
        b.len()
    );

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    finish_cosine(dot, norm_a, norm_b)
}

/// Euclidean distance between two equal-length vectors. Not used by the
/// retrieval path; kept alongside cosine for test symmetry.
#[allow(dead_code)]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    assert_eq!(
        a.len(),
        b.len(),
        "embedding dimension mismatch: {} vs {}",
        a.len(),
        b.len()
    );

    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
