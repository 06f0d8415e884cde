use itertools::izip;
use multiversion::multiversion;

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    assert!(b.len() == n);

    izip!(a, b).map(|(x, y)| x * y).sum()
}

/// `sum_i x_i * w_i * y_i`, the weighted inner product against a diagonal.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn weighted_dot(x: &[f64], w: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    assert!(w.len() == n);
    assert!(y.len() == n);

    izip!(x, w, y).map(|(a, b, c)| a * b * c).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn multiply(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(out.len() == n);

    izip!(a, b, out).for_each(|(x, y, o)| *o = x * y);
}
