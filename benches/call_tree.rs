use criterion::*;
use pyroscope_storage::call_tree::{CallTree, Scratch};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// Builds a tree out of `nstacks` random stacks up to `max_depth` frames deep, drawn from
// `nframes` distinct frames.
fn random_tree(rng: &mut SmallRng, nstacks: usize, max_depth: usize, nframes: i32) -> CallTree {
    let mut tree = CallTree::new(nstacks * max_depth);
    let mut stack = Vec::with_capacity(max_depth);
    for _ in 0..nstacks {
        stack.clear();
        let depth = rng.gen_range(1..=max_depth);
        stack.extend((0..depth).map(|_| rng.gen_range(1..=nframes)));
        tree.insert(&stack, rng.gen_range(1..1000));
    }
    tree.propagate();
    tree
}

fn call_tree_benchmark(c: &mut Criterion, id: &str, nstacks: usize) {
    let mut rng = SmallRng::seed_from_u64(42);
    let a = random_tree(&mut rng, nstacks, 32, 64);
    let b = random_tree(&mut rng, nstacks, 32, 64);

    let mut group = c.benchmark_group("call_tree");
    group.throughput(Throughput::Elements(b.len() as u64));

    group.bench_with_input(BenchmarkId::new("merge", id), &(&a, &b), |bench, (a, b)| {
        let mut scratch = Scratch::new();
        bench.iter(|| {
            let mut dst = (*a).clone();
            dst.merge_with(b, &mut scratch);
            dst
        })
    });

    group.bench_with_input(BenchmarkId::new("trim", id), &a, |bench, a| {
        let mut scratch = Scratch::new();
        bench.iter(|| {
            let mut dst = a.clone();
            dst.trim_with(a.len() / 8, &mut scratch);
            dst
        })
    });

    group.bench_with_input(BenchmarkId::new("transform_dfs", id), &a, |bench, a| {
        let mut scratch = Scratch::new();
        bench.iter(|| {
            let mut dst = CallTree::new(a.len());
            a.transform_dfs_with(&mut dst, &mut scratch);
            dst
        })
    });

    group.bench_with_input(BenchmarkId::new("encode", id), &a, |bench, a| {
        bench.iter(|| a.to_bytes())
    });

    group.finish();
}

macro_rules! call_tree_benchmarks {
    ($($name:ident : $nstacks:expr),*) => {
        $(
            fn $name(c: &mut Criterion) {
                let id = stringify!($name);
                call_tree_benchmark(c, id, $nstacks);
            }
        )*

        criterion_group!(benches, $($name),*);
        criterion_main!(benches);
    }
}

call_tree_benchmarks! {
    small: 100,
    large: 10_000
}
