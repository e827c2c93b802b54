/// Minimal tensor utilities for the neural memory engine.
///
/// All operations are free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. Weight matrices are stored `[fan_in, fan_out]`
/// so a linear layer is `x[n, fan_in] @ W[fan_in, fan_out]`.

// ── bf16 conversion helpers ──────────────────────────────────────────
//
// Rust has no native bf16. These round f32 → bf16 → f32 by zeroing
// the low 16 mantissa bits. Used by the quantized memory wrapper.

/// Round f32 to bf16 precision (round to nearest even).
#[inline]
pub fn f32_to_bf16(x: f32) -> f32 {
    let bits = x.to_bits();
    // Round to nearest even: add 0x7FFF + bit 16 (the "round" bit)
    let round = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
    f32::from_bits(round & 0xFFFF_0000)
}

/// Round a slice to bf16 precision in-place.
pub fn truncate_to_bf16(buf: &mut [f32]) {
    for v in buf.iter_mut() {
        *v = f32_to_bf16(*v);
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Matrix multiply with accumulation: C[M,N] += A[M,K] @ B[K,N].
pub fn matmul_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] += sum;
        }
    }
}

/// Weight-gradient product: C[K,N] += A[M,K]^T @ B[M,N].
///
/// For a linear layer `y = x @ W`, `dW += x^T @ dy`.
pub fn matmul_tn_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), m * n);
    debug_assert_eq!(out.len(), k * n);

    for r in 0..m {
        let a_row = &a[r * k..(r + 1) * k];
        let b_row = &b[r * n..(r + 1) * n];
        for p in 0..k {
            let ap = a_row[p];
            if ap == 0.0 { continue; }
            let out_row = &mut out[p * n..(p + 1) * n];
            for j in 0..n {
                out_row[j] += ap * b_row[j];
            }
        }
    }
}

/// Input-gradient product: C[M,K] = A[M,N] @ B[K,N]^T.
///
/// For a linear layer `y = x @ W`, `dx = dy @ W^T`.
pub fn matmul_nt_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, n: usize, k: usize) {
    debug_assert_eq!(a.len(), m * n);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * k);

    for i in 0..m {
        let a_row = &a[i * n..(i + 1) * n];
        for p in 0..k {
            let b_row = &b[p * n..(p + 1) * n];
            let mut sum = 0.0f32;
            for j in 0..n {
                sum += a_row[j] * b_row[j];
            }
            out[i * k + p] = sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
#[cfg(test)]
fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements. `-inf` entries receive zero weight.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

/// SiLU (Sigmoid Linear Unit): x * sigmoid(x). Smooth ReLU variant.
#[inline]
pub fn silu_f32(x: f32) -> f32 {
    x * sigmoid_f32(x)
}

/// SiLU derivative: sigmoid(x) + x * sigmoid(x) * (1 - sigmoid(x)).
#[inline]
pub fn silu_prime_f32(x: f32) -> f32 {
    let s = sigmoid_f32(x);
    s + x * s * (1.0 - s)
}

const GELU_C: f32 = 0.797_884_6; // sqrt(2/pi)
const GELU_A: f32 = 0.044_715;

/// GELU, tanh approximation: 0.5x(1 + tanh(c(x + 0.044715x³))).
#[inline]
pub fn gelu_f32(x: f32) -> f32 {
    let t = (GELU_C * (x + GELU_A * x * x * x)).tanh();
    0.5 * x * (1.0 + t)
}

/// Derivative of the tanh-approximated GELU.
#[inline]
pub fn gelu_prime_f32(x: f32) -> f32 {
    let t = (GELU_C * (x + GELU_A * x * x * x)).tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_C * (1.0 + 3.0 * GELU_A * x * x)
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Frobenius dot product: sum_ij A[i,j] * B[i,j].
/// Both A and B are flat slices of the same length.
#[cfg(test)]
fn frobenius_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

// ── Normalization ────────────────────────────────────────────────────

/// RMSNorm epsilon (matches f32 machine epsilon).
pub const RMS_EPS: f32 = f32::EPSILON;
/// LayerNorm epsilon.
pub const LN_EPS: f32 = 1e-5;

/// Row-wise RMSNorm: out = x / sqrt(mean(x²) + eps) * (gamma + gamma_offset).
///
/// `gamma` is `[cols]`. Learnable-scale norms store `gamma` directly
/// (offset 0, init 1); zero-init norms store `gamma - 1` (offset 1).
pub fn rms_norm_f32(
    x: &[f32],
    gamma: &[f32],
    gamma_offset: f32,
    out: &mut [f32],
    rows: usize,
    cols: usize,
) {
    debug_assert_eq!(x.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);
    debug_assert_eq!(gamma.len(), cols);

    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let ms = row.iter().map(|v| v * v).sum::<f32>() / cols as f32;
        let inv = 1.0 / (ms + RMS_EPS).sqrt();
        for c in 0..cols {
            out[r * cols + c] = row[c] * inv * (gamma[c] + gamma_offset);
        }
    }
}

/// Row-wise LayerNorm without affine terms.
///
/// Writes the normalized rows into `xhat` and returns the per-row `1/σ`
/// needed by [`layer_norm_backward_f32`].
pub fn layer_norm_f32(x: &[f32], xhat: &mut [f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), rows * cols);
    debug_assert_eq!(xhat.len(), rows * cols);

    let mut inv_std = vec![0.0f32; rows];
    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let mean = row.iter().sum::<f32>() / cols as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
        let inv = 1.0 / (var + LN_EPS).sqrt();
        inv_std[r] = inv;
        for c in 0..cols {
            xhat[r * cols + c] = (row[c] - mean) * inv;
        }
    }
    inv_std
}

/// Backward through [`layer_norm_f32`]: given d_xhat, returns d_x.
///
/// dx = inv_std * (d_xhat - mean(d_xhat) - xhat * mean(d_xhat * xhat))
pub fn layer_norm_backward_f32(
    xhat: &[f32],
    inv_std: &[f32],
    d_xhat: &[f32],
    rows: usize,
    cols: usize,
) -> Vec<f32> {
    debug_assert_eq!(xhat.len(), rows * cols);
    debug_assert_eq!(d_xhat.len(), rows * cols);

    let mut dx = vec![0.0f32; rows * cols];
    for r in 0..rows {
        let base = r * cols;
        let mut mean_d = 0.0f32;
        let mut mean_dx = 0.0f32;
        for c in 0..cols {
            mean_d += d_xhat[base + c];
            mean_dx += d_xhat[base + c] * xhat[base + c];
        }
        mean_d /= cols as f32;
        mean_dx /= cols as f32;
        for c in 0..cols {
            dx[base + c] = inv_std[r] * (d_xhat[base + c] - mean_d - xhat[base + c] * mean_dx);
        }
    }
    dx
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Xavier/Glorot uniform: bound = sqrt(6 / (fan_in + fan_out)).
    pub fn fill_xavier(&mut self, buf: &mut [f32], fan_in: usize, fan_out: usize) {
        let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
        self.fill_uniform(buf, bound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = [1.0, 0.0, 0.0, 1.0f32];
        let b = [1.0, 2.0, 3.0, 4.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 2, 2);
        assert_eq!(out, b);
    }

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 3, 2);
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_tn_matches_explicit_transpose() {
        // a: [3,2], b: [3,4] → a^T @ b: [2,4]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        let mut a_t = [0.0f32; 6];
        transpose_f32(&a, &mut a_t, 3, 2);
        let mut expected = [0.0f32; 8];
        matmul_f32(&a_t, &b, &mut expected, 2, 3, 4);
        let mut out = [1.0f32; 8];
        matmul_tn_acc_f32(&a, &b, &mut out, 3, 2, 4);
        for i in 0..8 {
            assert!((out[i] - (expected[i] + 1.0)).abs() < 1e-5, "i={i}");
        }
    }

    #[test]
    fn test_matmul_nt_matches_explicit_transpose() {
        // a: [2,3], b: [4,3] → a @ b^T: [2,4]
        let a = [1.0, -2.0, 3.0, 0.5, 5.0, -6.0f32];
        let b: Vec<f32> = (0..12).map(|i| i as f32 - 4.0).collect();
        let mut b_t = [0.0f32; 12];
        transpose_f32(&b, &mut b_t, 4, 3);
        let mut expected = [0.0f32; 8];
        matmul_f32(&a, &b_t, &mut expected, 2, 3, 4);
        let mut out = [0.0f32; 8];
        matmul_nt_f32(&a, &b, &mut out, 2, 3, 4);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_transpose() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let mut out = [0.0f32; 6];
        transpose_f32(&a, &mut out, 2, 3);
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_softmax_single_row() {
        let scores = [1.0, 2.0, 3.0f32];
        let mut out = [0.0f32; 3];
        softmax_f32(&scores, &mut out, 1, 3);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[0] < out[1]);
        assert!(out[1] < out[2]);
    }

    #[test]
    fn test_softmax_masked_entries() {
        let scores = [0.0, f32::NEG_INFINITY, 0.0f32];
        let mut out = [0.0f32; 3];
        softmax_f32(&scores, &mut out, 1, 3);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_xavier_bound() {
        let mut rng = SimpleRng::new(7);
        let mut buf = vec![0.0f32; 512];
        rng.fill_xavier(&mut buf, 16, 8);
        let bound = (6.0f32 / 24.0).sqrt();
        assert!(buf.iter().all(|v| v.abs() <= bound));
        assert!(buf.iter().any(|v| v.abs() > bound * 0.5));
    }

    #[test]
    fn test_bf16_truncation() {
        // bf16 has 7-bit mantissa → ~2 decimal digits
        let x = 1.234567f32;
        let bf = f32_to_bf16(x);
        assert!((bf - x).abs() < 0.01, "bf16({x}) = {bf}, expected within 0.01");
        assert_eq!(f32_to_bf16(0.0), 0.0);
        let neg = f32_to_bf16(-3.14159);
        assert!((neg - (-3.14159)).abs() < 0.03);
        // Idempotent
        assert_eq!(f32_to_bf16(bf), bf);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid_f32(0.0) - 0.5).abs() < 1e-6);
        assert!((sigmoid_f32(100.0) - 1.0).abs() < 1e-6);
        assert!((sigmoid_f32(-100.0) - 0.0).abs() < 1e-6);
        assert!((sigmoid_f32(3.0) - 0.9526).abs() < 0.001);
    }

    #[test]
    fn test_silu_prime() {
        for &x in &[-2.0f32, -1.0, 0.0, 0.5, 1.0, 3.0] {
            let eps = 1e-3;
            let numerical = (silu_f32(x + eps) - silu_f32(x - eps)) / (2.0 * eps);
            let analytical = silu_prime_f32(x);
            assert!((analytical - numerical).abs() < 1e-3,
                "silu_prime({x}): analytical={analytical}, numerical={numerical}");
        }
    }

    #[test]
    fn test_gelu_values() {
        assert_eq!(gelu_f32(0.0), 0.0);
        // gelu(1) ≈ 0.8412 (tanh approximation)
        assert!((gelu_f32(1.0) - 0.8412).abs() < 1e-3);
        assert!((gelu_f32(6.0) - 6.0).abs() < 1e-3);
        assert!(gelu_f32(-6.0).abs() < 1e-3);
    }

    #[test]
    fn test_gelu_prime() {
        for &x in &[-3.0f32, -1.0, -0.2, 0.0, 0.4, 1.5, 3.0] {
            let eps = 1e-3;
            let numerical = (gelu_f32(x + eps) - gelu_f32(x - eps)) / (2.0 * eps);
            let analytical = gelu_prime_f32(x);
            assert!((analytical - numerical).abs() < 2e-3,
                "gelu_prime({x}): analytical={analytical}, numerical={numerical}");
        }
    }

    #[test]
    fn test_rms_norm_unit_rms() {
        let x = [3.0f32, -4.0, 0.0, 5.0, 1.0, 1.0, 1.0, 1.0];
        let gamma = [1.0f32; 4];
        let mut out = [0.0f32; 8];
        rms_norm_f32(&x, &gamma, 0.0, &mut out, 2, 4);
        for r in 0..2 {
            let ms: f32 = out[r * 4..(r + 1) * 4].iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert!((ms - 1.0).abs() < 1e-4, "row {r} mean square {ms}");
        }
        // Zero-init gamma with offset 1 is the identity scale
        let zeros = [0.0f32; 4];
        let mut out2 = [0.0f32; 8];
        rms_norm_f32(&x, &zeros, 1.0, &mut out2, 2, 4);
        assert_eq!(out, out2);
    }

    #[test]
    fn test_layer_norm_moments() {
        let x = [1.0f32, 2.0, 3.0, 4.0, -1.0, 0.0, 2.0, 7.0];
        let mut xhat = [0.0f32; 8];
        let inv = layer_norm_f32(&x, &mut xhat, 2, 4);
        assert_eq!(inv.len(), 2);
        for r in 0..2 {
            let row = &xhat[r * 4..(r + 1) * 4];
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_backward_fd() {
        let x = [0.3f32, -1.2, 0.8, 2.0, -0.5, 0.1];
        let coef = [0.7f32, -0.3, 1.1, 0.4, -0.9, 0.2];
        let loss = |x: &[f32]| -> f32 {
            let mut xhat = vec![0.0f32; 6];
            layer_norm_f32(x, &mut xhat, 1, 6);
            frobenius_dot_f32(&xhat, &coef)
        };
        let mut xhat = vec![0.0f32; 6];
        let inv = layer_norm_f32(&x, &mut xhat, 1, 6);
        let dx = layer_norm_backward_f32(&xhat, &inv, &coef, 1, 6);
        let eps = 1e-3;
        for i in 0..6 {
            let mut xp = x;
            let mut xm = x;
            xp[i] += eps;
            xm[i] -= eps;
            let fd = (loss(&xp) - loss(&xm)) / (2.0 * eps);
            assert!((dx[i] - fd).abs() < 5e-3, "dx[{i}]: analytic={}, fd={fd}", dx[i]);
        }
    }

    #[test]
    fn test_frobenius_dot() {
        let a = [1.0, 2.0, 3.0, 4.0f32];
        let b = [5.0, 6.0, 7.0, 8.0f32];
        assert!((frobenius_dot_f32(&a, &b) - 70.0).abs() < 1e-6);
    }

    #[test]
    fn test_vec_norm_basic() {
        assert!((vec_norm_f32(&[3.0f32, 4.0]) - 5.0).abs() < 1e-6);
        assert!(vec_norm_f32(&[0.0f32; 4]).abs() < 1e-8);
    }
}
