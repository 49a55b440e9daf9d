//! Benchmarks for a full segment check pass
//!
//! Run with: cargo bench --package segcoord-checker --bench checker

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segcoord_checker::{
    Balance, Checker, Cluster, RoundRobinBalancer, ScoreBasedBalancer, SegmentChecker,
};
use segcoord_core::{Collection, LeaderView, Replica, Segment, SegmentInfo};
use segcoord_metadata::TargetConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const NODES: i64 = 8;
const CHANNEL: &str = "ch-0";

/// One collection, one replica over all nodes. A third of the target is
/// missing, every tenth placed segment has a stale second copy, and a few
/// copies no longer belong to the target.
fn synthetic_cluster(segments: i64) -> Cluster {
    let cluster = Cluster::new(TargetConfig::default());
    cluster
        .topology
        .load_collection(
            Collection::new(1, vec![1], 1),
            vec![Replica::new(1, 1, 1..=NODES)],
        )
        .unwrap();
    cluster.broker.set_recovery_info(
        1,
        1,
        vec![],
        (0..segments)
            .map(|id| {
                let mut info = SegmentInfo::new(id, 1, 1, CHANNEL);
                info.num_of_rows = 1_000 + id % 97;
                info
            })
            .collect(),
    );

    let mut by_node: BTreeMap<i64, Vec<Segment>> = BTreeMap::new();
    let mut leader = LeaderView::new(1, 1, CHANNEL).with_target_version(1);
    for id in 0..segments {
        if id % 3 == 0 {
            continue;
        }
        let node = 1 + id % NODES;
        by_node
            .entry(node)
            .or_default()
            .push(Segment::new(id, 1, 1, node, 2, CHANNEL));
        leader = leader.with_segment(id, node, 2);

        if id % 10 == 0 {
            let stale = 1 + (id + 1) % NODES;
            by_node
                .entry(stale)
                .or_default()
                .push(Segment::new(id, 1, 1, stale, 1, CHANNEL));
        }
    }
    for id in segments..segments + segments / 20 {
        let node = 1 + id % NODES;
        by_node
            .entry(node)
            .or_default()
            .push(Segment::new(id, 1, 1, node, 1, CHANNEL));
    }

    for (node, report) in by_node {
        cluster.dist.segment_dist.update(node, report);
    }
    cluster.dist.leader_views.update(1, vec![leader]);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(cluster.refresh_targets(true, &CancellationToken::new()))
        .unwrap();
    cluster
}

fn checker(cluster: &Cluster, balancer: Arc<dyn Balance>) -> SegmentChecker {
    SegmentChecker::new(
        cluster.topology.clone(),
        cluster.dist.clone(),
        cluster.targets.clone(),
        balancer,
    )
}

/// Benchmark a check pass at various cluster sizes
fn bench_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_check");
    group.sample_size(20);

    for segments in [1_000, 10_000, 50_000] {
        let cluster = synthetic_cluster(segments);
        let checker = checker(&cluster, Arc::new(RoundRobinBalancer::new()));
        let cancel = CancellationToken::new();

        group.throughput(Throughput::Elements(segments as u64));
        group.bench_with_input(
            BenchmarkId::new("round_robin", segments),
            &checker,
            |b, checker| b.iter(|| black_box(checker.check(&cancel))),
        );
    }

    group.finish();
}

/// Compare placement strategies on the same cluster
fn bench_balancers(c: &mut Criterion) {
    let cluster = synthetic_cluster(10_000);
    let cancel = CancellationToken::new();

    let mut group = c.benchmark_group("balancer_10k");
    group.sample_size(20);

    let round_robin = checker(&cluster, Arc::new(RoundRobinBalancer::new()));
    group.bench_function("round_robin", |b| {
        b.iter(|| black_box(round_robin.check(&cancel)))
    });

    let score_based = checker(
        &cluster,
        Arc::new(ScoreBasedBalancer::new(cluster.dist.clone())),
    );
    group.bench_function("score_based", |b| {
        b.iter(|| black_box(score_based.check(&cancel)))
    });

    group.finish();
}

criterion_group!(benches, bench_check, bench_balancers);
criterion_main!(benches);
