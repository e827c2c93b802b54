/// Criterion benchmarks for the neural memory engine.
///
/// Measures whole-sequence throughput across a width sweep, the cost of
/// token-by-token decoding, and the associative scan on its own.
///
/// Run: cargo bench --bench memory_bench
/// Reports saved to: target/criterion/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use neural_memory_core::associative_scan::{associative_scan, sequential_scan};
use neural_memory_core::tensor::SimpleRng;
use neural_memory_core::{ChunkSize, NeuralMemory, NeuralMemoryConfig};

fn make_config(d: usize) -> NeuralMemoryConfig {
    NeuralMemoryConfig {
        chunk_size: ChunkSize::Uniform(16),
        dim_head: Some(32),
        heads: d / 32,
        ..NeuralMemoryConfig::new(d)
    }
}

fn make_input(d: usize, seq_len: usize) -> Vec<f32> {
    let mut rng = SimpleRng::new(7);
    let mut x = vec![0.0f32; seq_len * d];
    rng.fill_uniform(&mut x, 1.0);
    x
}

/// Tokens per second for one 64-token call.
fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("process");
    let seq_len = 64;
    for d in [64, 128, 256] {
        let mem = NeuralMemory::new(make_config(d), 42).expect("valid bench config");
        let x = make_input(d, seq_len);
        group.throughput(Throughput::Elements(seq_len as u64));
        group.bench_with_input(BenchmarkId::new("chunked", format!("d={d}")), &d, |b, _| {
            b.iter(|| mem.process(&x, None, None, None).expect("process"));
        });
    }
    group.finish();
}

/// Incremental decoding: 32 one-token calls threading state.
fn bench_one_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("one_step");
    let seq_len = 32;
    for d in [64, 128] {
        let mem = NeuralMemory::new(make_config(d), 42).expect("valid bench config");
        let x = make_input(d, seq_len);
        group.throughput(Throughput::Elements(seq_len as u64));
        group.bench_with_input(BenchmarkId::new("decode", format!("d={d}")), &d, |b, _| {
            b.iter(|| {
                let mut state = mem.init_state();
                for token in x.chunks(d) {
                    let (_, next) = mem.process_one_step(token, state).expect("step");
                    state = next;
                }
                state
            });
        });
    }
    group.finish();
}

/// Parallel scan vs the sequential reference on a weight-sized state.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let state_size = 4096;
    for n in [16usize, 128] {
        let mut rng = SimpleRng::new(3);
        let gates: Vec<f32> = (0..n).map(|_| 0.9 + rng.uniform(0.05)).collect();
        let mut inputs = vec![0.0f32; n * state_size];
        rng.fill_uniform(&mut inputs, 1.0);
        let prev = vec![0.0f32; state_size];
        group.bench_with_input(BenchmarkId::new("associative", n), &n, |b, _| {
            b.iter(|| associative_scan(&gates, &inputs, &prev, state_size));
        });
        group.bench_with_input(BenchmarkId::new("sequential", n), &n, |b, _| {
            b.iter(|| sequential_scan(&gates, &inputs, &prev, state_size));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_process, bench_one_step, bench_scan);
criterion_main!(benches);
