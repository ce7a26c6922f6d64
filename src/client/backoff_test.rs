use super::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn policy() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_secs(3), Duration::from_secs(60))
}

#[test]
fn base_delay_doubles_until_cap() {
    let p = policy();
    let secs: Vec<u64> = (1..=7).map(|n| p.base_delay(n).as_secs()).collect();
    assert_eq!(secs, vec![3, 6, 12, 24, 48, 60, 60]);
}

#[test]
fn attempt_zero_behaves_like_first_attempt() {
    assert_eq!(policy().base_delay(0), Duration::from_secs(3));
}

#[test]
fn huge_attempt_numbers_stay_at_cap() {
    assert_eq!(policy().base_delay(u32::MAX), Duration::from_secs(60));
}

#[test]
fn jittered_delay_stays_within_twenty_percent() {
    let p = policy();
    let mut rng = StdRng::seed_from_u64(7);
    for attempt in 1..=20 {
        let floor = p.base_delay(attempt);
        let ceiling = floor.mul_f64(1.2);
        for _ in 0..200 {
            let delay = p.delay_with(attempt, &mut rng);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
    }
}

#[test]
fn floors_are_non_decreasing() {
    let p = policy();
    let floors: Vec<Duration> = (1..=30).map(|n| p.base_delay(n)).collect();
    assert!(floors.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn zero_jitter_is_deterministic() {
    let p = ReconnectPolicy { jitter_ratio: 0.0, ..policy() };
    assert_eq!(p.delay(2), Duration::from_secs(6));
}

#[test]
fn from_config_uses_interval_and_cap() {
    let config = ClientConfig {
        reconnect_interval: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(120),
        ..ClientConfig::default()
    };
    let p = ReconnectPolicy::from_config(&config);
    assert_eq!(p.base_delay(3), Duration::from_millis(120));
}
