//! Criterion benchmarks for validation and container writing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;
use weightsmith::{validate, write_safetensors, Checkpoint, Dtype, Entry, TensorData};

fn synthetic_checkpoint(layers: usize, rows: usize, cols: usize) -> Checkpoint {
    let mut rng = rand::thread_rng();
    let mut entries = Vec::with_capacity(layers * 2);
    for layer in 0..layers {
        let weight: Vec<u8> = (0..rows * cols)
            .flat_map(|_| rng.gen::<f32>().to_le_bytes())
            .collect();
        let bias: Vec<u8> = (0..rows).flat_map(|_| rng.gen::<f32>().to_le_bytes()).collect();
        entries.push((
            format!("blk.{}.weight", layer),
            Entry::Tensor(TensorData::new(Dtype::F32, vec![rows, cols], weight).unwrap()),
        ));
        entries.push((
            format!("blk.{}.bias", layer),
            Entry::Tensor(TensorData::new(Dtype::F32, vec![rows], bias).unwrap()),
        ));
    }
    Checkpoint { entries }
}

fn bench_conversion(c: &mut Criterion) {
    let checkpoint = synthetic_checkpoint(8, 256, 512);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bench.safetensors");

    c.bench_function("validate_8x256x512", |b| {
        b.iter(|| validate(black_box(&checkpoint)))
    });
    c.bench_function("write_safetensors_8x256x512", |b| {
        b.iter(|| write_safetensors(black_box(&checkpoint), black_box(&out)))
    });
}

criterion_group!(benches, bench_conversion);
criterion_main!(benches);
