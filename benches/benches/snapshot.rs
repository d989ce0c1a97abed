//! Benchmarks for subvolume snapshots.
//!
//! Performance-critical paths:
//! - `ReflinkVolumeDriver::snapshot`: tree walk plus per-file clone or copy
//! - `reflink::copy_tree` on wide and deep trees

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dbranch_kernel::volume::{reflink::copy_tree, ReflinkVolumeDriver, VolumeDriver};
use std::fs;
use std::path::Path;

fn populate(root: &Path, dirs: usize, files_per_dir: usize, file_size: usize) {
    let payload = vec![0xA5_u8; file_size];
    for d in 0..dirs {
        let dir = root.join(format!("base/{d}"));
        fs::create_dir_all(&dir).unwrap();
        for f in 0..files_per_dir {
            fs::write(dir.join(format!("{f}.dat")), &payload).unwrap();
        }
    }
}

fn bench_copy_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_tree");
    for &(dirs, files) in &[(1, 16), (8, 16), (32, 32)] {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path(), dirs, files, 8 * 1024);
        let src = tmp.path().join("base");
        let mut n = 0_u64;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{dirs}x{files}")),
            &src,
            |b, src| {
                b.iter(|| {
                    n += 1;
                    let dst = tmp.path().join(format!("copy-{n}"));
                    let stats = copy_tree(black_box(src), &dst, false).unwrap();
                    fs::remove_dir_all(&dst).unwrap();
                    stats
                });
            },
        );
    }
    group.finish();
}

fn bench_driver_snapshot(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let driver = ReflinkVolumeDriver::default();
    let device = tmp.path().join("device");
    let mount = tmp.path().join("mnt");
    driver.create_volume(&device, &mount, 1 << 30).unwrap();
    driver.mount(&device, &mount).unwrap();
    let main = mount.join("main");
    driver.create_subvolume(&main).unwrap();
    populate(&main, 4, 64, 16 * 1024);

    let mut n = 0_u64;
    c.bench_function("driver_snapshot_256_files", |b| {
        b.iter(|| {
            n += 1;
            let branch = mount.join(format!("b{n}"));
            driver.snapshot(&main, &branch).unwrap();
            driver.delete_subvolume(&branch).unwrap();
        });
    });
}

criterion_group!(benches, bench_copy_tree, bench_driver_snapshot);
criterion_main!(benches);
