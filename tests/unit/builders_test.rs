//! Tests for builder modules

use prometheus_task_pool::builders::pool_builder::PoolBuilder;
use prometheus_task_pool::config::{AutoScaleConfig, PoolConfig};
use prometheus_task_pool::{PoolError, WorkRegistry};

fn registry() -> WorkRegistry {
    WorkRegistry::new()
        .register("echo", |data, _ctx| Ok(data))
        .register_module("warm", || Ok(()))
}

#[test]
fn test_pool_builder_defaults() {
    let builder = PoolBuilder::new("pool1", registry()).with_config(PoolConfig::new().with_size(3));
    assert_eq!(builder.name(), "pool1");
    assert_eq!(builder.config().size, 3);
    assert_eq!(builder.autoscale_config(), &AutoScaleConfig::default());
}

#[test]
fn test_imports_apply_to_every_flavor() {
    let builder = PoolBuilder::new("img", registry()).with_imports(["warm"]);
    assert_eq!(builder.config().unit.imports, vec!["warm".to_string()]);
    assert_eq!(builder.autoscale_config().unit.imports, vec!["warm".to_string()]);
}

#[tokio::test]
async fn test_unknown_import_fails_every_build() {
    let builder = PoolBuilder::new("img", registry()).with_size(1).with_imports(["missing"]);
    assert!(matches!(builder.build_fixed(), Err(PoolError::InvalidConfig(_))));
    assert!(matches!(builder.build_reusable(), Err(PoolError::InvalidConfig(_))));
    assert!(matches!(builder.build_autoscaling(), Err(PoolError::InvalidConfig(_))));
    assert!(matches!(builder.build_oneshot(), Err(PoolError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_built_pools_run_work() {
    let builder = PoolBuilder::new("built", registry())
        .with_size(1)
        .with_autoscale(AutoScaleConfig::new().with_bounds(1, 2));

    let fixed = builder.build_fixed().unwrap();
    assert_eq!(fixed.submit("echo", "a".into(), Default::default()).await, Ok("a".into()));
    fixed.shutdown().await;

    let reusable = builder.build_autoscaling_reusable().unwrap();
    assert_eq!(reusable.run("echo", "b".into(), Default::default()).await, Ok("b".into()));
    reusable.shutdown().await;

    let oneshot = builder.build_oneshot().unwrap();
    assert_eq!(oneshot.run("echo", "c".into(), Default::default()).await, Ok("c".into()));
}
