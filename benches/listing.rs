//! 递归列表解析的性能
//!
//! 运行: cargo bench --bench listing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jobsync_lib::core::Listing;

/// 生成 `ls -lR --time-style=+%s` 格式的输出
fn generate_listing(dirs: usize, files_per_dir: usize) -> String {
    let mut out = String::new();
    for d in 0..dirs {
        out.push_str(&format!("/scratch/run/d{}:\ntotal {}\n", d, files_per_dir * 4));
        for f in 0..files_per_dir {
            out.push_str(&format!(
                "-rw-r--r-- 1 alice staff {:>8} {} output {}.dat\n",
                f * 1024,
                1_700_000_000 + f,
                f
            ));
        }
        out.push('\n');
    }
    out
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("listing_parse");

    for (dirs, files) in [(10, 100), (100, 100), (1000, 20)] {
        let output = generate_listing(dirs, files);
        group.throughput(Throughput::Elements((dirs * files) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", dirs, files)),
            &output,
            |b, output| b.iter(|| Listing::parse(black_box(output), "/scratch/run")),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
