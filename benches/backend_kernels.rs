use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use genben::genotype::{
    AlleleCounts, ChunkedGenotypes, ComputeCluster, CountAxis, DenseGenotypes,
    DistributedGenotypes, GenotypeError, GenotypeOps,
};
use genben::store::{StoreHandle, StoreLayout, StoreWriter};
use ndarray::{Array1, Array3, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;

const SAMPLES: usize = 256;
const CHUNK_LENGTH: usize = 1024;

fn random_store(path: &Path, n_variants: usize) -> StoreHandle {
    let mut rng = StdRng::seed_from_u64(0x6E_BE5 + n_variants as u64);
    let calls = Array3::from_shape_fn((n_variants, SAMPLES, 2), |_| {
        if rng.gen_bool(0.02) { -1 } else { i8::from(rng.gen_bool(0.3)) }
    });
    let mut writer = StoreWriter::create(
        path,
        StoreLayout {
            samples: (0..SAMPLES).map(|i| format!("S{i}")).collect(),
            ploidy: 2,
            chunk_length: CHUNK_LENGTH,
            chunk_width: 64,
            alt_number: 1,
            compression_level: 1,
        },
    )
    .expect("create store");
    for start in (0..n_variants).step_by(CHUNK_LENGTH) {
        let end = (start + CHUNK_LENGTH).min(n_variants);
        writer
            .write_chunk(calls.slice(s![start..end, .., ..]))
            .expect("write chunk");
    }
    writer.finish().expect("finish store")
}

fn bench_counts<G: GenotypeOps>(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
    name: &str,
    n_variants: usize,
    genotypes: &G,
) {
    group.bench_with_input(
        BenchmarkId::new(format!("{name}/alleles"), n_variants),
        genotypes,
        |b, g| {
            b.iter(|| black_box(g.realize::<Result<AlleleCounts, GenotypeError>>(g.count_alleles())))
        },
    );
    group.bench_with_input(
        BenchmarkId::new(format!("{name}/het_per_sample"), n_variants),
        genotypes,
        |b, g| {
            b.iter(|| {
                black_box(g.realize::<Result<Array1<u32>, GenotypeError>>(
                    g.count_het(CountAxis::Samples),
                ))
            })
        },
    );
}

fn benchmark_backends(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temporary directory");
    let cluster = ComputeCluster::new(0).expect("compute pool");

    let mut group = c.benchmark_group("backend_kernels");
    group.sample_size(20);
    for n_variants in [4_096_usize, 16_384] {
        let store = Arc::new(random_store(&dir.path().join(format!("s{n_variants}")), n_variants));
        let stores = [store];
        group.throughput(Throughput::Elements((n_variants * SAMPLES) as u64));

        let dense = DenseGenotypes::from_stores(&stores).expect("dense array");
        bench_counts(&mut group, "dense", n_variants, &dense);
        bench_counts(&mut group, "chunked", n_variants, &ChunkedGenotypes::from_stores(&stores));
        bench_counts(
            &mut group,
            "distributed",
            n_variants,
            &DistributedGenotypes::from_stores(&stores, cluster.clone()),
        );
    }
    group.finish();
}

criterion_group!(backend_kernels, benchmark_backends);
criterion_main!(backend_kernels);
