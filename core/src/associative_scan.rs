/// Associative Scan: exact parallelization for linear recurrences.
///
/// Blelloch parallel prefix scan: given s_t = a_t * s_{t-1} + b_t for all t,
/// compute all prefix states in O(n) work and O(log n) depth.
///
/// Both recurrences of the neural memory are of this form: momentum
/// (S_t = eta_t * S_{t-1} + u_t) and weights (W_t = (1 - alpha_t) * W_{t-1} + S_t).
///
/// Composition is carried in f64 and rounded to f32 once per output, so long
/// products of gates near 1 (or near 0) keep their accuracy.

// ═════════════════════════════════════════════════════════════════════
// Scan elements: s' = a*s + b
// ═════════════════════════════════════════════════════════════════════

/// The associative operator is: (a1, b1) ⊕ (a2, b2) = (a1*a2, a2*b1 + b2)
trait ScanElement: Clone {
    fn compose(left: &Self, right: &Self) -> Self;
}

/// Scalar gate shared by every channel.
#[derive(Clone)]
struct ScalarElement {
    a: f64,
    /// Additive term: [state_size]
    b: Vec<f64>,
}

impl ScanElement for ScalarElement {
    fn compose(left: &Self, right: &Self) -> Self {
        let b = left.b.iter().zip(right.b.iter())
            .map(|(l, r)| right.a * l + r)
            .collect();
        ScalarElement { a: left.a * right.a, b }
    }
}

/// Independent gate per channel.
#[derive(Clone)]
struct ChannelElement {
    /// Decay factors: [state_size]
    a: Vec<f64>,
    /// Additive term: [state_size]
    b: Vec<f64>,
}

impl ScanElement for ChannelElement {
    fn compose(left: &Self, right: &Self) -> Self {
        let a = left.a.iter().zip(right.a.iter()).map(|(l, r)| l * r).collect();
        let b = left.b.iter().zip(right.a.iter()).zip(right.b.iter())
            .map(|((l, ra), rb)| ra * l + rb)
            .collect();
        ChannelElement { a, b }
    }
}

/// Blelloch (Brent-Kung) inclusive prefix scan, in place.
///
/// After the call, `tree[t]` is `e_0 ⊕ e_1 ⊕ … ⊕ e_t`.
fn blelloch_inclusive<T: ScanElement>(tree: &mut [T]) {
    let n = tree.len();
    if n < 2 {
        return;
    }

    // Up-sweep (reduce phase)
    let mut stride = 1;
    while stride < n {
        let mut i = 2 * stride - 1;
        while i < n {
            tree[i] = T::compose(&tree[i - stride], &tree[i]);
            i += 2 * stride;
        }
        stride *= 2;
    }

    // Down-sweep: propagate partial prefixes to the remaining positions.
    stride /= 2;
    while stride >= 1 {
        let mut i = 3 * stride - 1;
        while i < n {
            tree[i] = T::compose(&tree[i - stride], &tree[i]);
            i += 2 * stride;
        }
        if stride == 1 { break; }
        stride /= 2;
    }
}

// ═════════════════════════════════════════════════════════════════════
// Public scans
// ═════════════════════════════════════════════════════════════════════

/// Scan with one scalar gate per step.
///
/// Computes out[t] = gates[t] * out[t-1] + inputs[t] with out[-1] = prev.
///
/// Returns states [s_0, s_1, ..., s_{n-1}] as flat [n * state_size].
/// Zero-length input yields an empty output (use [`final_state`] to
/// resume from it).
pub fn associative_scan(
    gates: &[f32],         // [n] scalar decay factors
    inputs: &[f32],        // [n * state_size] additive terms
    prev: &[f32],          // [state_size] initial state
    state_size: usize,
) -> Vec<f32> {
    let wide: Vec<f64> = prev.iter().map(|&x| x as f64).collect();
    associative_scan_carried(gates, inputs, &wide, state_size).0
}

/// [`associative_scan`] resumed from an f64 state.
///
/// Also returns the last state in f64 (`prev` when `n == 0`). Feeding it
/// back as the next `prev` continues the recurrence exactly as one longer
/// scan would, without rounding the state at the seam.
pub fn associative_scan_carried(
    gates: &[f32],
    inputs: &[f32],
    prev: &[f64],
    state_size: usize,
) -> (Vec<f32>, Vec<f64>) {
    let n = gates.len();
    assert_eq!(inputs.len(), n * state_size);
    assert_eq!(prev.len(), state_size);

    if n == 0 {
        return (Vec::new(), prev.to_vec());
    }

    let mut tree: Vec<ScalarElement> = (0..n).map(|t| ScalarElement {
        a: gates[t] as f64,
        b: inputs[t * state_size..(t + 1) * state_size].iter().map(|&x| x as f64).collect(),
    }).collect();
    blelloch_inclusive(&mut tree);

    let mut states = vec![0.0f32; n * state_size];
    for t in 0..n {
        for j in 0..state_size {
            states[t * state_size + j] = (tree[t].a * prev[j] + tree[t].b[j]) as f32;
        }
    }
    let last = &tree[n - 1];
    let carry = (0..state_size).map(|j| last.a * prev[j] + last.b[j]).collect();
    (states, carry)
}

/// Scan with an independent gate for every channel of every step.
///
/// `gates` and `inputs` are both [n * state_size].
pub fn associative_scan_channels(
    gates: &[f32],
    inputs: &[f32],
    prev: &[f32],
    state_size: usize,
) -> Vec<f32> {
    assert_eq!(gates.len(), inputs.len());
    assert_eq!(prev.len(), state_size);
    if state_size == 0 {
        return Vec::new();
    }
    assert_eq!(inputs.len() % state_size, 0);
    let n = inputs.len() / state_size;

    if n == 0 {
        return Vec::new();
    }

    let mut tree: Vec<ChannelElement> = (0..n).map(|t| {
        let span = t * state_size..(t + 1) * state_size;
        ChannelElement {
            a: gates[span.clone()].iter().map(|&x| x as f64).collect(),
            b: inputs[span].iter().map(|&x| x as f64).collect(),
        }
    }).collect();
    blelloch_inclusive(&mut tree);

    let mut states = vec![0.0f32; n * state_size];
    for t in 0..n {
        for j in 0..state_size {
            states[t * state_size + j] = (tree[t].a[j] * prev[j] as f64 + tree[t].b[j]) as f32;
        }
    }
    states
}

/// Last state of a scan output, or `prev` when the scan was empty.
pub fn final_state<'a>(states: &'a [f32], prev: &'a [f32], state_size: usize) -> &'a [f32] {
    if states.len() < state_size || state_size == 0 {
        prev
    } else {
        &states[states.len() - state_size..]
    }
}

/// Sequential reference: the recurrence evaluated step by step in f64.
pub fn sequential_scan(
    gates: &[f32],
    inputs: &[f32],
    prev: &[f32],
    state_size: usize,
) -> Vec<f32> {
    let n = gates.len();
    assert_eq!(inputs.len(), n * state_size);
    assert_eq!(prev.len(), state_size);

    let mut s: Vec<f64> = prev.iter().map(|&x| x as f64).collect();
    let mut states = vec![0.0f32; n * state_size];
    for t in 0..n {
        let a = gates[t] as f64;
        for j in 0..state_size {
            s[j] = a * s[j] + inputs[t * state_size + j] as f64;
            states[t * state_size + j] = s[j] as f32;
        }
    }
    states
}

/// Stacked momentum: order o smooths the output of order o-1.
///
/// `gates[o]` is [n] for order o, `prev[o]` is that order's carried buffer.
/// Returns one [n * state_size] trajectory per order; the last one is the
/// update fed to the weight scan unless the orders are mixed.
pub fn momentum_scan(
    gates: &[Vec<f32>],
    surprises: &[f32],
    prev: &[&[f32]],
    state_size: usize,
) -> Vec<Vec<f32>> {
    let wide: Vec<Vec<f64>> = prev.iter().map(|p| p.iter().map(|&x| x as f64).collect()).collect();
    let refs: Vec<&[f64]> = wide.iter().map(Vec::as_slice).collect();
    momentum_scan_carried(gates, surprises, &refs, state_size).0
}

/// [`momentum_scan`] with f64 carried buffers in and out.
pub fn momentum_scan_carried(
    gates: &[Vec<f32>],
    surprises: &[f32],
    prev: &[&[f64]],
    state_size: usize,
) -> (Vec<Vec<f32>>, Vec<Vec<f64>>) {
    assert_eq!(gates.len(), prev.len());
    let mut orders: Vec<Vec<f32>> = Vec::with_capacity(gates.len());
    let mut carries = Vec::with_capacity(gates.len());
    for (o, order_gates) in gates.iter().enumerate() {
        let input = if o == 0 { surprises } else { orders[o - 1].as_slice() };
        let (states, carry) = associative_scan_carried(order_gates, input, prev[o], state_size);
        orders.push(states);
        carries.push(carry);
    }
    (orders, carries)
}
