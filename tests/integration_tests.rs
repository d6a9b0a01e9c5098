//! Runs against a real Docker daemon: `cargo test -- --ignored`.

use anyhow::Result;
use std::sync::Arc;
use testpool::domain::{ContainerSpec, Hook, ImageRef};
use testpool::infra::DockerAdapter;
use testpool::services::{HookRegistry, Pool, PoolState};

fn redis_spec() -> Result<ContainerSpec> {
    let mut spec = ContainerSpec::new("testpool_it_redis", ImageRef::parse("redis:7-alpine")?);
    spec.ports = vec!["26379:6379".parse()?];
    spec.hooks = vec![Hook::Exec {
        command: vec!["redis-cli".to_string(), "flushall".to_string()],
    }];
    Ok(spec)
}

#[tokio::test]
#[ignore = "needs a running docker daemon"]
async fn test_redis_pool_lifecycle() -> Result<()> {
    let runtime = Arc::new(DockerAdapter::connect().await?);
    let mut pool = Pool::new(runtime, Arc::new(HookRegistry::with_builtins()));
    pool.add(redis_spec()?)?;

    let result = pool.start().await;

    let handle = pool.handle("testpool_it_redis").unwrap().clone();
    let running = handle.running().await?;
    let ping = handle
        .exec(&["redis-cli".to_string(), "ping".to_string()])
        .await;

    pool.close().await;
    pool.purge().await;

    result?;
    assert!(running);
    assert!(ping?.output.contains("PONG"));
    assert_eq!(pool.state(), PoolState::Purged);
    assert!(!handle.exists().await?);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running docker daemon"]
async fn test_missing_container_inspects_as_absent() -> Result<()> {
    let runtime = Arc::new(DockerAdapter::connect().await?);
    let pool = {
        let mut pool = Pool::new(runtime, Arc::new(HookRegistry::new()));
        let spec = ContainerSpec::new("testpool_it_absent", ImageRef::parse("busybox")?);
        pool.add(spec)?;
        pool
    };

    let handle = &pool.handles()[0];
    assert!(!handle.exists().await?);
    assert!(!handle.running().await?);
    Ok(())
}
