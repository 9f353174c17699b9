//! 动态绑定演示：时钟上下线驱动问候服务的发布与撤销。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_binding=debug cargo run --bin binding_demo -- [config.toml]
//! ```
//! 省略配置路径时使用内置的 `config/binding_demo.toml`。
//!
//! # 演示流程
//! 1. 问候组件依赖强制引用 `clock`，追踪器在时钟缺席时保持其未发布；
//! 2. 发布时钟后绑定器完成绑定，满足度变化驱动问候服务发布，`greeters` 集合随之出现该实例；
//! 3. 撤销时钟后问候服务被同步撤销，再调用时按超时等待并最终报告 `binding.service_unavailable`。

use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use spark_binding::observability::install_subscriber;
use spark_binding::{
    BindingConfig, CollectionBinder, ComponentDefinition, ComponentGraph, DependencyGraphTracker,
    Importer, ReferenceBinder, RegistrationHandler, ServiceExporter, ambient,
};
use spark_registry::properties::PROVIDER_CONTEXT;
use spark_registry::{InMemoryRegistry, Properties, Registry, ServiceObject};

const BUILTIN_CONFIG: &str = include_str!("../../config/binding_demo.toml");

trait Clock: Send + Sync {
    fn now(&self) -> String;
}

trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

struct FixedClock {
    zone: &'static str,
}

impl Clock for FixedClock {
    fn now(&self) -> String {
        let context = ambient::current();
        format!(
            "12:00 {} (context: {})",
            self.zone,
            context.as_deref().unwrap_or("none")
        )
    }
}

struct ClockedGreeter {
    clock: ReferenceBinder<dyn Clock>,
}

impl Greeter for ClockedGreeter {
    fn greet(&self, name: &str) -> String {
        match self.clock.invoke(|clock| clock.now()) {
            Ok(now) => format!("hello {name}, it is {now}"),
            Err(err) => format!("hello {name} ({})", err.code()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    install_subscriber(None).context("installing log subscriber")?;

    let text = match env::args().nth(1) {
        Some(path) => fs::read_to_string(&path).with_context(|| format!("reading {path}"))?,
        None => BUILTIN_CONFIG.to_owned(),
    };
    let config = BindingConfig::from_toml_str(&text).context("loading binding configuration")?;
    let retry = config.retry_policy();

    let memory = InMemoryRegistry::new();
    let registry: Arc<dyn Registry> = Arc::new(memory.clone());

    let clock: ReferenceBinder<dyn Clock> =
        ReferenceBinder::builder(config.reference("clock")?, Arc::clone(&registry))
            .retry(&retry)
            .build()?;
    let greeters: CollectionBinder<dyn Greeter> =
        CollectionBinder::with_retry(config.reference("greeters")?, Arc::clone(&registry), &retry)?;

    let graph = Arc::new(ComponentGraph::new());
    let clock_importer: Arc<dyn Importer> = Arc::new(clock.clone());
    graph.register(ComponentDefinition::singleton("greeting").with_importer(clock_importer))?;

    let tracker = DependencyGraphTracker::new(Arc::clone(&registry), Arc::clone(&graph));
    let greeter: Arc<dyn Greeter> = Arc::new(ClockedGreeter {
        clock: clock.clone(),
    });
    let exporter = ServiceExporter::new(
        "greeter",
        "greeting",
        vec!["demo.Greeter".to_owned()],
        ServiceObject::new(greeter),
    )
    .with_properties(Properties::new().with("weight", 10));
    exporter.add_registration_listener(
        "announce",
        RegistrationHandler::notify(|| {
            tracing::info!("greeter is now available");
            Ok(())
        }),
    );
    let handle = tracker.add_exporter(exporter);
    tracing::info!(
        published = tracker.is_published(&handle),
        "greeter registered with tracker while clock is absent"
    );

    let utc: Arc<dyn Clock> = Arc::new(FixedClock { zone: "UTC" });
    let clock_registration = memory.publish(
        &["demo.Clock".to_owned()],
        Properties::new()
            .with("zone", "UTC")
            .with(PROVIDER_CONTEXT, "tenant-utc"),
        ServiceObject::new(utc),
    )?;
    tracing::info!(
        published = tracker.is_published(&handle),
        greeters = greeters.len(),
        "clock published"
    );
    for bound in greeters.iter() {
        tracing::info!(
            service.id = bound.service_id().get(),
            greeting = %bound.service().greet("world"),
            "greeter responded"
        );
    }

    clock_registration.withdraw();
    tracing::info!(
        published = tracker.is_published(&handle),
        greeters = greeters.len(),
        clock_satisfied = clock.is_satisfied(),
        "clock withdrawn"
    );
    if let Err(err) = clock.invoke(|clock| clock.now()) {
        tracing::info!(code = err.code(), error = %err, "direct clock call failed as expected");
    }

    tracker.remove_exporter(&handle);
    greeters.destroy();
    clock.destroy();
    tracing::info!(
        services = memory.service_count(),
        subscriptions = memory.subscription_count(),
        "demo finished"
    );
    Ok(())
}
