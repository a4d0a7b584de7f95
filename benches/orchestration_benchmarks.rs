use criterion::{black_box, criterion_group, criterion_main, Criterion};
use orchestrator_core::config::LoadBalancerSettings;
use orchestrator_core::orchestration::{PriorityQueue, WorkPriority};
use orchestrator_core::scaling::{LoadBalancer, RoutingAlgorithm, ServiceInstance};
use orchestrator_core::EventStore;

const PRIORITIES: [WorkPriority; 4] = [
    WorkPriority::Critical,
    WorkPriority::High,
    WorkPriority::Normal,
    WorkPriority::Low,
];

fn benchmark_queue_throughput(c: &mut Criterion) {
    c.bench_function("priority_queue_push_pop_1k", |b| {
        b.iter(|| {
            let mut queue = PriorityQueue::new();
            for n in 0..1_000u32 {
                queue.push(PRIORITIES[(n % 4) as usize], n);
            }
            while let Some(item) = queue.pop() {
                black_box(item);
            }
        })
    });
}

fn balancer(algorithm: RoutingAlgorithm) -> LoadBalancer {
    let balancer = LoadBalancer::new(
        LoadBalancerSettings {
            default_algorithm: algorithm,
            weighted_seed: Some(42),
        },
        EventStore::default(),
    );
    for n in 0..16u16 {
        let instance = ServiceInstance::new(format!("i{n}"), "10.0.0.1", 8000 + n)
            .with_weight(u32::from(n % 4) + 1);
        let _ = balancer.register_instance("api", instance);
    }
    balancer
}

fn benchmark_routing(c: &mut Criterion) {
    for algorithm in [
        RoutingAlgorithm::RoundRobin,
        RoutingAlgorithm::LeastConnections,
        RoutingAlgorithm::Weighted,
        RoutingAlgorithm::IpHash,
    ] {
        let balancer = balancer(algorithm);
        c.bench_function(&format!("route_{algorithm}"), |b| {
            b.iter(|| black_box(balancer.select_instance("api", Some("198.51.100.7"))))
        });
    }
}

criterion_group!(benches, benchmark_queue_throughput, benchmark_routing);
criterion_main!(benches);
