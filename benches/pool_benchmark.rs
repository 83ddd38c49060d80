use criterion::{black_box, criterion_group, criterion_main, Criterion};

use async_trait::async_trait;
use fdfs::backend::{self, Connector, Endpoint, SharedConnector};
use fdfs::policy::Policy;
use fdfs::pool::Pool;
use fdfs::registry::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn criterion_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 10", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(10)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 100", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(100)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 1000", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(1000)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("registry lookups across 10 addresses", |b| {
        b.to_async(&rt)
            .iter(|| concurrent_lookups(black_box(10), black_box(100)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

struct TestConnection {}

struct TestConnector {}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, _endpoint: &Endpoint) -> Result<Self::Connection, backend::Error> {
        Ok(TestConnection {})
    }
}

fn endpoint(port: u16) -> Endpoint {
    Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port))
}

async fn concurrent_claims(count: usize) {
    let connector: SharedConnector<TestConnection> = Arc::new(TestConnector {});
    let pool = Arc::new(
        Pool::new(
            "bench".to_string(),
            vec![endpoint(23000)],
            connector,
            Policy::default(),
        )
        .await
        .expect("Failed to create pool"),
    );

    let futs: Vec<_> = (0..count)
        .map(|_| {
            tokio::task::spawn({
                let pool = pool.clone();
                async move {
                    let handle = pool.claim().await.expect("Failed to get claim");
                    tokio::time::sleep(tokio::time::Duration::from_micros(50)).await;
                    drop(handle);
                }
            })
        })
        .collect();
    futures::future::try_join_all(futs)
        .await
        .expect("Failed to get claims");
}

async fn concurrent_lookups(addresses: u16, count: usize) {
    let connector: SharedConnector<TestConnection> = Arc::new(TestConnector {});
    let registry = Arc::new(Registry::new(connector, Policy::default()));

    let futs: Vec<_> = (0..count)
        .map(|i| {
            tokio::task::spawn({
                let registry = registry.clone();
                let address = endpoint(23000 + (i as u16 % addresses));
                async move {
                    registry
                        .lookup_or_create(address)
                        .await
                        .expect("Failed to get pool");
                }
            })
        })
        .collect();
    futures::future::try_join_all(futs)
        .await
        .expect("Failed to look up pools");
}
