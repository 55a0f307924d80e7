//! Integration tests for the native delay providers
#![cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]

use std::thread;
use std::time::{Duration, Instant};

use precise_delay::{DelayError, DelayInterval, PortableDelay, PreciseDelay, create_precise_delay};

/// Elapsed wall time of each of `iterations` delays of `requested`, sorted
fn sample_elapsed(provider: &dyn PreciseDelay, requested: Duration, iterations: usize) -> Vec<Duration> {
    let mut samples: Vec<_> = (0..iterations)
        .map(|_| {
            let start = Instant::now();
            provider.delay_for(requested, false).expect("delay failed");
            start.elapsed()
        })
        .collect();
    samples.sort_unstable();
    samples
}

#[test]
fn test_provider_creation_and_basic_usage() {
    let provider = create_precise_delay().expect("Failed to create native provider");

    let platform = provider.platform_name();
    assert!(!platform.is_empty());
    println!("Using provider: {}", provider.info());

    let start = Instant::now();
    provider.delay_for(Duration::from_millis(1), false).expect("delay failed");
    assert!(start.elapsed() >= Duration::from_millis(1));
}

#[test]
fn test_delay_never_undershoots() {
    let provider = create_precise_delay().expect("Failed to create native provider");

    for nanos in [1, 99, 100, 101, 10_000, 333_333, 1_000_000, 4_999_999] {
        let requested = Duration::from_nanos(nanos);
        let start = Instant::now();
        provider
            .delay(DelayInterval::relative(requested).unwrap(), false)
            .expect("delay failed");
        let elapsed = start.elapsed();

        assert!(
            elapsed >= requested,
            "Delay of {requested:?} undershot: elapsed {elapsed:?}"
        );
    }
}

#[test]
fn test_crate_level_sleep_helpers() {
    let start = Instant::now();
    precise_delay::sleep(Duration::from_micros(1_500)).expect("sleep failed");
    assert!(start.elapsed() >= Duration::from_micros(1_500));

    let start = Instant::now();
    precise_delay::sleep_ns(800_000, true).expect("sleep_ns failed");
    assert!(start.elapsed() >= Duration::from_micros(800));

    let start = Instant::now();
    precise_delay::delay(DelayInterval::relative_nanos(500_000).unwrap(), false).expect("delay failed");
    assert!(start.elapsed() >= Duration::from_micros(500));
}

#[test]
fn test_zero_delay_returns_promptly() {
    let provider = create_precise_delay().expect("Failed to create native provider");

    let start = Instant::now();
    for _ in 0..100 {
        provider.delay(DelayInterval::ZERO, false).expect("zero delay failed");
    }
    let elapsed = start.elapsed();

    println!("100 zero delays took {elapsed:?}");
    // Each zero delay is at most a yield, never a full tick
    assert!(elapsed < Duration::from_millis(100), "Zero delays too slow: {elapsed:?}");

    let start = Instant::now();
    precise_delay::sleep_ns(0, false).expect("zero sleep_ns failed");
    assert!(start.elapsed() < Duration::from_millis(20));
}

#[test]
fn test_out_of_range_duration_is_rejected() {
    let provider = create_precise_delay().expect("Failed to create native provider");

    let start = Instant::now();
    let result = provider.delay_for(Duration::MAX, false);
    assert!(matches!(result, Err(DelayError::InvalidParameter(_))), "got {result:?}");

    let result = precise_delay::sleep(Duration::MAX);
    assert!(matches!(result, Err(DelayError::InvalidParameter(_))), "got {result:?}");

    // Rejection must not block
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_alertable_without_pending_event_matches_non_alertable() {
    let provider = create_precise_delay().expect("Failed to create native provider");
    let requested = Duration::from_millis(2);

    let mut alertable = Vec::with_capacity(20);
    let mut plain = Vec::with_capacity(20);

    for _ in 0..20 {
        let start = Instant::now();
        provider.delay_for(requested, true).expect("alertable delay failed");
        alertable.push(start.elapsed());

        let start = Instant::now();
        provider.delay_for(requested, false).expect("delay failed");
        plain.push(start.elapsed());
    }

    // Nothing is queued to this thread, so neither mode may return early
    assert!(alertable.iter().all(|elapsed| *elapsed >= requested));
    assert!(plain.iter().all(|elapsed| *elapsed >= requested));

    alertable.sort_unstable();
    plain.sort_unstable();
    let alertable_median = alertable[alertable.len() / 2];
    let plain_median = plain[plain.len() / 2];
    println!("median alertable={alertable_median:?} non-alertable={plain_median:?}");

    // Generous bound for shared CI hosts
    let difference = alertable_median.abs_diff(plain_median);
    assert!(difference < Duration::from_millis(5), "Modes diverged by {difference:?}");
}

#[test]
fn test_concurrent_delays_are_independent() {
    let handles: Vec<_> = (1..=8u64)
        .map(|id| {
            thread::spawn(move || {
                let requested = Duration::from_micros(id * 750);
                let start = Instant::now();
                precise_delay::sleep(requested).expect("sleep failed");
                let elapsed = start.elapsed();

                println!("Thread {id} requested {requested:?}, slept {elapsed:?}");
                assert!(elapsed >= requested, "Thread {id} undershot: {elapsed:?} < {requested:?}");
                (requested, elapsed)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("Thread failed")).collect();
    assert_eq!(results.len(), 8);
}

#[test]
fn test_shared_provider_across_threads() {
    let provider: &'static dyn PreciseDelay = precise_delay::global().expect("global provider");

    thread::scope(|scope| {
        for id in 0..4u64 {
            scope.spawn(move || {
                for _ in 0..10 {
                    let requested = Duration::from_micros(200 + id * 100);
                    let start = Instant::now();
                    provider.delay_for(requested, false).expect("delay failed");
                    assert!(start.elapsed() >= requested);
                }
            });
        }
    });
}

#[test]
#[ignore] // Flaky on CI due to VMs, so run it on a local machine.
fn test_native_is_tighter_than_portable_sleep() {
    const ITERATIONS: usize = 100;
    let requested = Duration::from_millis(2);

    let native = create_precise_delay().expect("Failed to create native provider");
    let portable = PortableDelay::default();

    let native_samples = sample_elapsed(native.as_ref(), requested, ITERATIONS);
    let portable_samples = sample_elapsed(&portable, requested, ITERATIONS);

    // Spread between the 10th and 90th percentile
    let spread = |samples: &[Duration]| samples[ITERATIONS * 9 / 10] - samples[ITERATIONS / 10];
    let native_spread = spread(&native_samples);
    let portable_spread = spread(&portable_samples);

    println!("native p10-p90 spread: {native_spread:?}, portable: {portable_spread:?}");
    println!(
        "native p90 overshoot: {:?}, portable: {:?}",
        native_samples[ITERATIONS * 9 / 10] - requested,
        portable_samples[ITERATIONS * 9 / 10] - requested
    );

    assert!(
        native_samples[ITERATIONS * 9 / 10] <= portable_samples[ITERATIONS * 9 / 10],
        "Native delay overshoots more than the portable sleep"
    );
    assert!(native_spread <= portable_spread + Duration::from_micros(100));
}
