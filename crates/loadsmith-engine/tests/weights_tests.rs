mod support;

use loadsmith_engine::engine::probe::{LatencyBand, TargetProbe};
use loadsmith_engine::engine::target::Target;
use loadsmith_engine::engine::weights::{Strategy, StrategySampler, StrategyWeights};
use loadsmith_engine::SessionError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::Duration;

fn weights(http: f64, post: f64, hold: f64, hybrid: f64) -> StrategyWeights {
    let mut w = StrategyWeights::uniform();
    w.set(Strategy::HttpFlood, http);
    w.set(Strategy::PostFlood, post);
    w.set(Strategy::ConnectionHold, hold);
    w.set(Strategy::Hybrid, hybrid);
    w
}

#[test]
fn test_sampling_frequencies_follow_weights() {
    let sampler = StrategySampler::new(&weights(0.4, 0.3, 0.2, 0.1)).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let draws = 100_000;
    let mut counts: HashMap<Strategy, usize> = HashMap::new();
    for _ in 0..draws {
        *counts.entry(sampler.sample(&mut rng)).or_default() += 1;
    }
    for (strategy, expected) in [
        (Strategy::HttpFlood, 0.4),
        (Strategy::PostFlood, 0.3),
        (Strategy::ConnectionHold, 0.2),
        (Strategy::Hybrid, 0.1),
    ] {
        let observed = counts.get(&strategy).copied().unwrap_or(0) as f64 / draws as f64;
        assert!(
            (observed - expected).abs() < 0.02,
            "{} drawn {:.3}, expected {:.3}",
            strategy,
            observed,
            expected
        );
    }
}

#[test]
fn test_zero_weight_is_never_sampled() {
    let sampler = StrategySampler::new(&weights(1.0, 0.0, 0.0, 1.0)).unwrap();
    assert!(!sampler.contains(Strategy::PostFlood));
    assert!(!sampler.contains(Strategy::ConnectionHold));
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..10_000 {
        let s = sampler.sample(&mut rng);
        assert!(s == Strategy::HttpFlood || s == Strategy::Hybrid);
    }
}

#[test]
fn test_pick_boundaries() {
    let sampler = StrategySampler::new(&weights(0.0, 1.0, 0.0, 3.0)).unwrap();
    assert_eq!(sampler.total(), 4.0);
    assert_eq!(sampler.pick(0.0), Strategy::PostFlood);
    assert_eq!(sampler.pick(0.2), Strategy::PostFlood);
    assert_eq!(sampler.pick(0.25), Strategy::Hybrid);
    assert_eq!(sampler.pick(0.999), Strategy::Hybrid);
    assert_eq!(sampler.pick(1.0), Strategy::Hybrid);
}

#[test]
fn test_all_zero_weights_rejected() {
    let err = StrategySampler::new(&weights(0.0, 0.0, 0.0, 0.0)).unwrap_err();
    assert!(matches!(err, SessionError::InvalidConfig(_)));
}

#[test]
fn test_latency_bands() {
    assert_eq!(LatencyBand::classify(Duration::from_millis(20)), LatencyBand::Fast);
    assert_eq!(LatencyBand::classify(Duration::from_millis(100)), LatencyBand::Normal);
    assert_eq!(LatencyBand::classify(Duration::from_millis(500)), LatencyBand::Normal);
    assert_eq!(LatencyBand::classify(Duration::from_secs(1)), LatencyBand::Normal);
    assert_eq!(LatencyBand::classify(Duration::from_secs(2)), LatencyBand::Slow);
}

#[test]
fn test_slow_band_raises_hold_weight() {
    let mut w = StrategyWeights::uniform();
    w.adjust_for(LatencyBand::classify(Duration::from_secs(2)));
    assert!(w.get(Strategy::ConnectionHold) > 0.25);
    assert!(w.get(Strategy::ConnectionHold) > w.get(Strategy::HttpFlood));
    assert_eq!(w.get(Strategy::HttpFlood), 0.25);
}

#[test]
fn test_fast_band_raises_flood_weights() {
    let mut w = StrategyWeights::uniform();
    w.adjust_for(LatencyBand::Fast);
    assert!(w.get(Strategy::HttpFlood) > 0.25);
    assert!(w.get(Strategy::PostFlood) > 0.25);
    assert_eq!(w.get(Strategy::ConnectionHold), 0.25);
}

#[test]
fn test_normal_band_and_zero_weights_unchanged() {
    let mut w = weights(0.5, 0.0, 0.0, 0.5);
    let before = w;
    w.adjust_for(LatencyBand::Normal);
    assert_eq!(w, before);
    w.adjust_for(LatencyBand::Slow);
    assert_eq!(w.get(Strategy::ConnectionHold), 0.0);
}

#[tokio::test]
async fn test_probe_of_slow_target_is_slow() {
    let (addr, _) = support::spawn_http_server(200, Duration::from_millis(1200)).await;
    let target = Target::parse(&addr.to_string()).unwrap();
    let outcome = TargetProbe::new(target, "/health").probe().await.unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.band, LatencyBand::Slow);
}

#[tokio::test]
async fn test_probe_counts_error_status_as_reachable() {
    let (addr, seen) = support::spawn_http_server(500, Duration::ZERO).await;
    let target = Target::parse(&addr.to_string()).unwrap();
    let outcome = TargetProbe::new(target, "/health").probe().await.unwrap();
    assert_eq!(outcome.status, 500);
    assert_eq!(outcome.band, LatencyBand::Fast);
    assert_eq!(seen.count(), 1);
}

#[tokio::test]
async fn test_probe_of_closed_port_is_unreachable() {
    let addr = support::refused_addr().await;
    let target = Target::parse(&addr.to_string()).unwrap();
    let err = TargetProbe::new(target, "/").probe().await.unwrap_err();
    assert!(matches!(err, SessionError::ProbeUnreachable { .. }));
}

#[tokio::test]
async fn test_probe_timeout_is_unreachable() {
    let (addr, _) = support::spawn_http_server(200, Duration::from_secs(3)).await;
    let target = Target::parse(&addr.to_string()).unwrap();
    let err = TargetProbe::new(target, "/")
        .with_timeout(Duration::from_millis(200))
        .probe()
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ProbeUnreachable { .. }));
}
