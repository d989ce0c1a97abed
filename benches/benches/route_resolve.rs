//! Benchmarks for the proxy route table.
//!
//! Every accepted connection resolves its route once, so `resolve` sits on
//! the connection hot path while `publish` runs on every switch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dbranch_kernel::domain::{BranchName, ProjectName};
use dbranch_kernel::proxy::{Route, RouteTable};
use std::net::{Ipv4Addr, SocketAddr};

fn table(projects: usize) -> (RouteTable, Vec<ProjectName>) {
    let routes = RouteTable::new();
    let names: Vec<ProjectName> = (0..projects)
        .map(|i| ProjectName::new(format!("project-{i}")).unwrap())
        .collect();
    for (port, name) in (7000_u16..).zip(&names) {
        routes.publish(
            name,
            Route {
                branch: BranchName::main(),
                backend: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            },
        );
    }
    (routes, names)
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_resolve");
    for &projects in &[1_usize, 16, 256] {
        let (routes, names) = table(projects);
        group.bench_with_input(
            BenchmarkId::from_parameter(projects),
            &names,
            |b, names| {
                let mut i = 0;
                b.iter(|| {
                    i = (i + 1) % names.len();
                    black_box(routes.resolve(&names[i]))
                });
            },
        );
    }
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let (routes, names) = table(16);
    let b1 = BranchName::new("b1").unwrap();
    c.bench_function("route_publish", |b| {
        b.iter(|| {
            routes.publish(
                &names[0],
                Route {
                    branch: b1.clone(),
                    backend: SocketAddr::from((Ipv4Addr::LOCALHOST, 7100)),
                },
            )
        });
    });
}

criterion_group!(benches, bench_resolve, bench_publish);
criterion_main!(benches);
