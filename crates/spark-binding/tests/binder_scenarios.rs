//! 绑定器端到端场景。
//!
//! # 教案级导览
//! - **Why**：绑定器的价值在于“实例来去对调用方透明”，这些性质只有在真实注册表上跑完整的
//!   发布、撤销、等待流程才能验证；
//! - **How**：每个测试使用独立的 [`InMemoryRegistry`]，通过发布/撤销驱动绑定器状态，必要时用线程制造竞争；
//! - **What**：覆盖超时语义、换绑安全、兜底、上下文切换、相等性、显式目标与拆除。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spark_binding::{
    BindHandler, BindingError, CapabilityReference, Cardinality, ContextPolicy, Importer,
    ImporterId, OnUnavailable, ReferenceBinder, TargetSelector, ambient,
};
use spark_registry::properties::{PROVIDER_CONTEXT, SERVICE_RANKING};
use spark_registry::{InMemoryRegistry, Properties, Registration, Registry, ServiceObject};

trait Echo: Send + Sync {
    fn tag(&self) -> String;
}

struct Tagged(String);

impl Echo for Tagged {
    fn tag(&self) -> String {
        self.0.clone()
    }
}

fn publish_echo(registry: &InMemoryRegistry, tag: &str, properties: Properties) -> Registration {
    let service: Arc<dyn Echo> = Arc::new(Tagged(tag.to_owned()));
    registry
        .publish(
            &["demo.Echo".to_owned()],
            properties.with("tag", tag),
            ServiceObject::new(service),
        )
        .expect("发布成功")
}

fn echo_reference(cardinality: Cardinality, timeout: Duration) -> CapabilityReference {
    CapabilityReference::builder("echo")
        .interface("demo.Echo")
        .cardinality(cardinality)
        .timeout(timeout)
        .build()
        .expect("合法引用")
}

fn observed_context() -> Option<String> {
    ambient::current().map(|value| value.to_string())
}

fn shared(registry: &InMemoryRegistry) -> Arc<dyn Registry> {
    Arc::new(registry.clone())
}

/// ## 场景：强制引用超时 2s，实例在 2.5s 才出现
///
/// - **契约 (What)**：调用阻塞至少 2s 后返回 `ServiceUnavailable`；实例出现后的调用立即成功。
#[test]
fn mandatory_reference_times_out_before_late_arrival() {
    let registry = InMemoryRegistry::new();
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::from_secs(2)),
        shared(&registry),
    )
    .expect("构造绑定器");

    let late = {
        let registry = registry.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2500));
            publish_echo(&registry, "late", Properties::new())
        })
    };

    let started = Instant::now();
    let outcome = binder.invoke(|echo| echo.tag());
    let elapsed = started.elapsed();
    match outcome {
        Err(BindingError::ServiceUnavailable {
            reference, waited, ..
        }) => {
            assert_eq!(reference, "echo");
            assert!(waited >= Duration::from_secs(2), "实际等待 {waited:?}");
        }
        other => panic!("应超时失败，实际为 {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2500), "不应等到实例出现");

    let _registration = late.join().expect("发布线程不应 panic");
    assert_eq!(binder.invoke(|echo| echo.tag()), Ok("late".to_owned()));
}

/// 等待期间到达的实例会唤醒等待者，而不是等到下一个重试间隔。
#[test]
fn arrival_wakes_waiting_invocation() {
    let registry = InMemoryRegistry::new();
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::from_secs(10)),
        shared(&registry),
    )
    .expect("构造绑定器");
    binder.retry_policy().reset(Duration::from_secs(30));

    let publisher = {
        let registry = registry.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            publish_echo(&registry, "prompt", Properties::new())
        })
    };
    let started = Instant::now();
    assert_eq!(binder.invoke(|echo| echo.tag()), Ok("prompt".to_owned()));
    assert!(started.elapsed() < Duration::from_secs(5));
    let _registration = publisher.join().expect("发布线程不应 panic");
}

/// ## 场景：换绑安全
///
/// - **意图 (Why)**：撤销后的实例绝不能再交给调用方；
/// - **逻辑 (How)**：滚动替换时始终先发布新实例再撤销旧实例，调用方使用零超时，任何一次失败都意味着
///   绑定器交出了失效句柄或漏掉了在线候选。
#[test]
fn rolling_replacement_never_leaves_a_gap() {
    let registry = InMemoryRegistry::new();
    let mut current = publish_echo(&registry, "gen-0", Properties::new());
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::ZERO),
        shared(&registry),
    )
    .expect("构造绑定器");

    let stop = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicUsize::new(0));
    let callers: Vec<_> = (0..4)
        .map(|_| {
            let binder = binder.clone();
            let stop = Arc::clone(&stop);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if binder.invoke(|echo| echo.tag()).is_err() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for generation in 1..200 {
        let next = publish_echo(&registry, &format!("gen-{generation}"), Properties::new());
        current.withdraw();
        current = next;
    }
    stop.store(true, Ordering::Release);
    for caller in callers {
        caller.join().expect("调用线程不应 panic");
    }

    assert_eq!(failures.load(Ordering::Relaxed), 0, "滚动替换期间不应出现不可用");
    assert_eq!(binder.invoke(|echo| echo.tag()), Ok("gen-199".to_owned()));
}

#[test]
fn departure_fires_unbind_and_rebinds_to_remaining_candidate() {
    let registry = InMemoryRegistry::new();
    let first = publish_echo(&registry, "first", Properties::new());
    let _second = publish_echo(&registry, "second", Properties::new());
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::ZERO),
        shared(&registry),
    )
    .expect("构造绑定器");

    let events = Arc::new(Mutex::new(Vec::new()));
    let on_bind = Arc::clone(&events);
    let on_unbind = Arc::clone(&events);
    binder.add_bind_listener(
        "bind-log",
        BindHandler::service_only(move |echo: &Arc<dyn Echo>| {
            on_bind.lock().push(format!("bind:{}", echo.tag()));
            Ok(())
        }),
    );
    binder.add_unbind_listener(
        "unbind-log",
        BindHandler::full(move |echo: &Arc<dyn Echo>, properties: &Properties| {
            assert!(properties.contains_key("tag"), "解绑时应携带属性快照");
            on_unbind.lock().push(format!("unbind:{}", echo.tag()));
            Ok(())
        }),
    );

    first.withdraw();
    assert_eq!(
        *events.lock(),
        vec!["unbind:first".to_owned(), "bind:second".to_owned()]
    );
    assert_eq!(binder.invoke(|echo| echo.tag()), Ok("second".to_owned()));
}

#[test]
fn optional_reference_falls_back_or_fails_as_configured() {
    let registry = InMemoryRegistry::new();
    let fallback_reference = CapabilityReference::builder("echo")
        .interface("demo.Echo")
        .cardinality(Cardinality::Optional)
        .timeout(Duration::from_millis(50))
        .on_unavailable(OnUnavailable::Fallback)
        .build()
        .expect("合法引用");
    let fallback: Arc<dyn Echo> = Arc::new(Tagged("fallback".to_owned()));
    let with_fallback: ReferenceBinder<dyn Echo> =
        ReferenceBinder::with_fallback(fallback_reference.clone(), shared(&registry), fallback)
            .expect("构造绑定器");
    assert_eq!(with_fallback.invoke(|echo| echo.tag()), Ok("fallback".to_owned()));
    assert!(with_fallback.is_satisfied(), "可选引用恒为满足");

    let failing: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Optional, Duration::from_millis(50)),
        shared(&registry),
    )
    .expect("构造绑定器");
    assert!(matches!(
        failing.invoke(|echo| echo.tag()),
        Err(BindingError::ServiceUnavailable { .. })
    ));

    let _live = publish_echo(&registry, "live", Properties::new());
    assert_eq!(with_fallback.invoke(|echo| echo.tag()), Ok("live".to_owned()));

    assert!(matches!(
        ReferenceBinder::<dyn Echo>::new(fallback_reference, shared(&registry)),
        Err(BindingError::InvalidConfiguration { .. })
    ));
    assert!(matches!(
        ReferenceBinder::<dyn Echo>::with_fallback(
            echo_reference(Cardinality::Optional, Duration::ZERO),
            shared(&registry),
            Arc::new(Tagged("unused".to_owned())),
        ),
        Err(BindingError::InvalidConfiguration { .. })
    ));
}

#[test]
fn context_policy_substitutes_and_restores_ambient_context() {
    let registry = InMemoryRegistry::new();
    let _provider = publish_echo(
        &registry,
        "ctx",
        Properties::new().with(PROVIDER_CONTEXT, "provider-ctx"),
    );
    let reference = |policy: ContextPolicy| {
        CapabilityReference::builder("echo")
            .interface("demo.Echo")
            .context(policy)
            .timeout(Duration::ZERO)
            .build()
            .expect("合法引用")
    };

    let client: ReferenceBinder<dyn Echo> = ambient::scope(Some(Arc::from("client-ctx")), || {
        ReferenceBinder::new(reference(ContextPolicy::Client), shared(&registry))
    })
    .expect("构造绑定器");
    let provider: ReferenceBinder<dyn Echo> =
        ReferenceBinder::new(reference(ContextPolicy::ServiceProvider), shared(&registry))
            .expect("构造绑定器");
    let unmanaged: ReferenceBinder<dyn Echo> =
        ReferenceBinder::new(reference(ContextPolicy::Unmanaged), shared(&registry))
            .expect("构造绑定器");

    let seen = thread::spawn(move || {
        let _caller = ambient::enter(Some(Arc::from("caller-ctx")));
        let results = (
            client.invoke(|_| observed_context()),
            provider.invoke(|_| observed_context()),
            unmanaged.invoke(|_| observed_context()),
        );
        (results, observed_context())
    })
    .join()
    .expect("调用线程不应 panic");

    let ((client_seen, provider_seen, unmanaged_seen), after) = seen;
    assert_eq!(client_seen, Ok(Some("client-ctx".to_owned())));
    assert_eq!(provider_seen, Ok(Some("provider-ctx".to_owned())));
    assert_eq!(unmanaged_seen, Ok(Some("caller-ctx".to_owned())));
    assert_eq!(after.as_deref(), Some("caller-ctx"), "调用结束后应恢复调用方上下文");
}

#[test]
fn equality_follows_reference_and_bound_target() {
    let registry = InMemoryRegistry::new();
    let make = || {
        ReferenceBinder::<dyn Echo>::new(
            echo_reference(Cardinality::Optional, Duration::ZERO),
            shared(&registry),
        )
        .expect("构造绑定器")
    };
    let unbound_a = make();
    let unbound_b = make();
    assert_eq!(unbound_a, unbound_b, "同一引用且都未绑定时相等");

    let _only = publish_echo(&registry, "only", Properties::new());
    assert!(unbound_a.is_bound() && unbound_b.is_bound());
    assert_eq!(unbound_a, unbound_b, "绑定到同一发布时相等");

    let hash = |binder: &ReferenceBinder<dyn Echo>| {
        let mut hasher = DefaultHasher::new();
        binder.hash(&mut hasher);
        hasher.finish()
    };
    assert_eq!(hash(&unbound_a), hash(&unbound_b));

    let other = ReferenceBinder::<dyn Echo>::new(
        echo_reference(Cardinality::Mandatory, Duration::ZERO),
        shared(&registry),
    )
    .expect("构造绑定器");
    assert_ne!(unbound_a, other, "引用不同则不相等");
}

#[test]
fn explicit_target_overrides_ranking_and_filter() {
    let registry = InMemoryRegistry::new();
    let _preferred = publish_echo(
        &registry,
        "preferred",
        Properties::new().with(SERVICE_RANKING, 100),
    );
    let _chosen = publish_echo(
        &registry,
        "chosen",
        Properties::new().with("component.name", "chosen-component"),
    );
    let reference = CapabilityReference::builder("echo")
        .interface("demo.Echo")
        .filter("(tag=preferred)")
        .target(TargetSelector::ComponentName("chosen-component".to_owned()))
        .timeout(Duration::ZERO)
        .build()
        .expect("合法引用");
    let binder: ReferenceBinder<dyn Echo> =
        ReferenceBinder::new(reference, shared(&registry)).expect("构造绑定器");
    assert_eq!(binder.invoke(|echo| echo.tag()), Ok("chosen".to_owned()));
}

#[test]
fn destroy_is_idempotent_and_releases_everything() {
    let registry = InMemoryRegistry::new();
    let _instance = publish_echo(&registry, "bound", Properties::new());
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::ZERO),
        shared(&registry),
    )
    .expect("构造绑定器");
    let unbinds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unbinds);
    binder.add_unbind_listener(
        "count",
        BindHandler::properties_only(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let satisfaction_events = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&satisfaction_events);
    binder.add_satisfaction_listener(Arc::new(move |_: ImporterId, _: bool| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));
    let subscriptions_before = registry.subscription_count();

    assert!(binder.destroy());
    assert!(!binder.destroy(), "重复拆除应返回 false");
    assert_eq!(unbinds.load(Ordering::SeqCst), 1);
    assert_eq!(satisfaction_events.load(Ordering::SeqCst), 0, "拆除不发出满足度通知");
    assert_eq!(registry.subscription_count(), subscriptions_before - 1);
    assert!(matches!(
        binder.invoke(|echo| echo.tag()),
        Err(BindingError::Destroyed { .. })
    ));
    assert!(binder.current().is_none());
}

#[test]
fn destroy_interrupts_a_blocked_invocation() {
    let registry = InMemoryRegistry::new();
    let binder: ReferenceBinder<dyn Echo> = ReferenceBinder::new(
        echo_reference(Cardinality::Mandatory, Duration::from_secs(30)),
        shared(&registry),
    )
    .expect("构造绑定器");
    let barrier = Arc::new(Barrier::new(2));
    let waiter = {
        let binder = binder.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let started = Instant::now();
            (binder.invoke(|echo| echo.tag()), started.elapsed())
        })
    };
    barrier.wait();
    thread::sleep(Duration::from_millis(100));
    assert!(binder.destroy());

    let (outcome, elapsed) = waiter.join().expect("等待线程不应 panic");
    assert!(matches!(outcome, Err(BindingError::Destroyed { .. })));
    assert!(elapsed < Duration::from_secs(5), "拆除应及时中断等待，实际 {elapsed:?}");
}
