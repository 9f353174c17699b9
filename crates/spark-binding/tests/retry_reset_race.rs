//! 重试循环与 `reset` / `wake` / `cancel` 的竞争。
//!
//! # 教案级导览
//! - **Why**：等待中的调用依赖事件线程的唤醒才能及时看到新实例；若唤醒落在“检查失败”与“进入睡眠”之间被丢失，
//!   调用方会白白睡满一个间隔；
//! - **How**：间隔设为 10s、预算 200ms，另一线程在屏障后先置位条件再 `reset(0)`，统计成功比例；
//! - **What**：丢失唤醒的比例必须低于 1%。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use spark_binding::{RetryDeadline, RetryPolicy};

const TRIALS: usize = 10_000;

#[test]
fn reset_racing_with_failed_attempt_is_not_lost() {
    let mut observed = 0_usize;
    for _ in 0..TRIALS {
        let policy = RetryPolicy::new(Duration::from_secs(10));
        let ready = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));

        let resetter = {
            let policy = policy.clone();
            let ready = Arc::clone(&ready);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ready.store(true, Ordering::Release);
                policy.reset(Duration::ZERO);
            })
        };

        barrier.wait();
        let outcome = policy.execute(RetryDeadline::Within(Duration::from_millis(200)), || {
            ready.load(Ordering::Acquire).then_some(())
        });
        resetter.join().expect("重置线程不应 panic");
        if outcome.is_some() {
            observed += 1;
        }
    }
    assert!(
        observed * 100 >= TRIALS * 99,
        "仅 {observed}/{TRIALS} 次观察到重置"
    );
}

#[test]
fn reset_shortens_an_unbounded_wait() {
    let policy = RetryPolicy::new(Duration::from_secs(60));
    let attempts = Arc::new(AtomicUsize::new(0));
    let waker = {
        let policy = policy.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            policy.reset(Duration::from_millis(1));
        })
    };

    let started = Instant::now();
    let counter = Arc::clone(&attempts);
    let outcome = policy.execute(RetryDeadline::Unbounded, || {
        (counter.fetch_add(1, Ordering::SeqCst) >= 3).then_some("done")
    });
    waker.join().expect("重置线程不应 panic");

    assert_eq!(outcome, Some("done"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(policy.interval(), Duration::from_millis(1), "重置持久生效");
}

#[test]
fn wake_rechecks_without_changing_interval() {
    let policy = RetryPolicy::new(Duration::from_secs(60));
    let ready = Arc::new(AtomicBool::new(false));
    let waker = {
        let policy = policy.clone();
        let ready = Arc::clone(&ready);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ready.store(true, Ordering::Release);
            policy.wake();
        })
    };
    let started = Instant::now();
    let outcome = policy.execute(RetryDeadline::Within(Duration::from_secs(30)), || {
        ready.load(Ordering::Acquire).then_some(())
    });
    waker.join().expect("唤醒线程不应 panic");
    assert_eq!(outcome, Some(()));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(policy.interval(), Duration::from_secs(60));
}

#[test]
fn cancel_releases_an_unbounded_waiter() {
    let policy = RetryPolicy::new(Duration::from_secs(60));
    let canceller = {
        let policy = policy.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            policy.cancel()
        })
    };
    let started = Instant::now();
    let outcome = policy.execute(RetryDeadline::Unbounded, || None::<()>);
    assert!(canceller.join().expect("取消线程不应 panic"), "首次取消返回 true");
    assert_eq!(outcome, None);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(policy.is_cancelled());
    assert!(!policy.cancel(), "重复取消返回 false");
    assert_eq!(
        policy.execute(RetryDeadline::Unbounded, || Some(1)),
        Some(1),
        "取消后仍执行首次尝试"
    );
}
