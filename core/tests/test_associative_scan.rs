//! Integration tests for the associative scan.
//!
//! Verifies the parallel scan against the sequential f64 reference and the
//! resumption property the engine relies on across calls.

use neural_memory_core::associative_scan::{
    associative_scan, associative_scan_carried, associative_scan_channels, final_state,
    momentum_scan, momentum_scan_carried, sequential_scan,
};
use neural_memory_core::tensor::SimpleRng;
use proptest::prelude::*;

/// Largest difference relative to max(1, |expected|).
fn max_rel_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs() / y.abs().max(1.0))
        .fold(0.0f32, f32::max)
}

fn random_sequence(n: usize, size: usize, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut rng = SimpleRng::new(seed);
    let gates: Vec<f32> = (0..n).map(|_| 0.5 + rng.uniform(0.49)).collect();
    let mut inputs = vec![0.0f32; n * size];
    rng.fill_uniform(&mut inputs, 1.0);
    let mut prev = vec![0.0f32; size];
    rng.fill_uniform(&mut prev, 1.0);
    (gates, inputs, prev)
}

/// Scan of 300 steps agrees with the sequential recurrence.
#[test]
fn test_long_scan_matches_sequential() {
    let (gates, inputs, prev) = random_sequence(300, 5, 1);
    let par = associative_scan(&gates, &inputs, &prev, 5);
    let seq = sequential_scan(&gates, &inputs, &prev, 5);
    let diff = max_rel_diff(&par, &seq);
    assert!(diff < 1e-6, "max_diff={diff:.3e}");
}

/// A gate of exactly zero forgets everything before it.
#[test]
fn test_zero_gate_resets_state() {
    let gates = [0.9f32, 0.0, 0.9];
    let inputs = [1.0f32, 2.0, 3.0];
    let states = associative_scan(&gates, &inputs, &[100.0], 1);
    assert!((states[1] - 2.0).abs() < 1e-6);
    assert!((states[2] - (0.9 * 2.0 + 3.0)).abs() < 1e-5);
}

/// Channel gates broadcast per element; uniform channel gates equal the scalar scan.
#[test]
fn test_channel_scan_with_uniform_gates() {
    let (gates, inputs, prev) = random_sequence(17, 3, 2);
    let wide: Vec<f32> = gates.iter().flat_map(|&g| [g; 3]).collect();
    let a = associative_scan(&gates, &inputs, &prev, 3);
    let b = associative_scan_channels(&wide, &inputs, &prev, 3);
    assert!(max_rel_diff(&a, &b) < 1e-6);
}

/// Stacked momentum of order 2 equals two chained scalar scans.
#[test]
fn test_momentum_orders_chain() {
    let (g1, surprises, p1) = random_sequence(9, 4, 3);
    let (g2, _, p2) = random_sequence(9, 4, 4);
    let orders = momentum_scan(&[g1.clone(), g2.clone()], &surprises, &[&p1[..], &p2[..]], 4);
    assert_eq!(orders.len(), 2);
    let first = sequential_scan(&g1, &surprises, &p1, 4);
    let second = sequential_scan(&g2, &first, &p2, 4);
    assert!(max_rel_diff(&orders[0], &first) < 1e-6);
    assert!(max_rel_diff(&orders[1], &second) < 1e-6);
}

/// Resuming from the f64 carry continues the recurrence as one long scan.
#[test]
fn test_carried_resume_matches_single_scan() {
    let (gates, inputs, prev) = random_sequence(64, 6, 9);
    let size = 6;
    let wide: Vec<f64> = prev.iter().map(|&x| x as f64).collect();
    let (full, full_carry) = associative_scan_carried(&gates, &inputs, &wide, size);
    assert_eq!(full, associative_scan(&gates, &inputs, &prev, size));

    let k = 37;
    let (head, carry) = associative_scan_carried(&gates[..k], &inputs[..k * size], &wide, size);
    let (tail, tail_carry) = associative_scan_carried(&gates[k..], &inputs[k * size..], &carry, size);
    let last: Vec<f32> = carry.iter().map(|&c| c as f32).collect();
    assert_eq!(&last[..], final_state(&head, &prev, size));

    assert!(max_rel_diff(&tail, &full[k * size..]) < 1e-7);
    for (a, b) in tail_carry.iter().zip(full_carry.iter()) {
        assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
    }
}

#[test]
fn test_carried_scan_of_nothing_returns_prev() {
    let prev = [0.25f64, -1.5];
    let (states, carry) = associative_scan_carried(&[], &[], &prev, 2);
    assert!(states.is_empty());
    assert_eq!(carry, prev.to_vec());

    let (orders, carries) = momentum_scan_carried(&[vec![], vec![]], &[], &[&prev[..], &prev[..]], 2);
    assert!(orders.iter().all(Vec::is_empty));
    assert_eq!(carries, vec![prev.to_vec(), prev.to_vec()]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// scan(seq[k:], prev = scan(seq[:k]).last) == scan(seq)[k:]
    #[test]
    fn prop_scan_resumes_at_any_split(n in 1usize..80, k_frac in 0.0f64..1.0, seed in 0u64..10_000) {
        let size = 3;
        let (gates, inputs, prev) = random_sequence(n, size, seed);
        let k = ((n as f64) * k_frac) as usize;

        let full = associative_scan(&gates, &inputs, &prev, size);
        let head = associative_scan(&gates[..k], &inputs[..k * size], &prev, size);
        let resume = final_state(&head, &prev, size).to_vec();
        let tail = associative_scan(&gates[k..], &inputs[k * size..], &resume, size);

        prop_assert!(max_rel_diff(&head, &full[..k * size]) < 1e-6);
        prop_assert!(max_rel_diff(&tail, &full[k * size..]) < 1e-6);
    }
}
