use std::time::Duration;

use super::RateAverager;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_not_ready_before_first_wrap() {
    let mut avg = RateAverager::default();
    for i in 1..RateAverager::DEFAULT_WINDOW as u64 {
        avg.push(ms(i));
        assert!(!avg.average_ready());
    }
    assert_eq!(avg.average(), Duration::ZERO);
    assert_eq!(avg.eta(100), None);
}

#[test]
fn test_ready_after_full_window_with_mean() {
    let mut avg = RateAverager::new(10);
    for i in 1..=10 {
        avg.push(ms(i));
    }
    assert!(avg.average_ready());
    assert_eq!(avg.average(), Duration::from_micros(5500));
}

#[test]
fn test_not_ready_after_one_more_sample() {
    let mut avg = RateAverager::new(4);
    for _ in 0..4 {
        avg.push(ms(20));
    }
    assert!(avg.average_ready());

    avg.push(ms(100));
    assert!(!avg.average_ready());
    // stale value is kept until the next wrap
    assert_eq!(avg.average(), ms(20));

    for _ in 0..3 {
        avg.push(ms(100));
    }
    assert!(avg.average_ready());
    assert_eq!(avg.average(), ms(100));
}

#[test]
fn test_get_average_clears_ready() {
    let mut avg = RateAverager::new(2);
    avg.push(ms(10));
    avg.push(ms(30));

    assert_eq!(avg.get_average(false), ms(20));
    assert!(avg.average_ready());
    assert_eq!(avg.get_average(true), ms(20));
    assert!(!avg.average_ready());
}

#[test]
fn test_eta_floors_at_zero() {
    let mut avg = RateAverager::new(1);
    avg.push(ms(1));
    assert_eq!(avg.eta(0), Some(Duration::ZERO));

    let eta = avg.eta(10_000).unwrap();
    assert!(eta <= Duration::from_secs(10));
    assert!(eta > Duration::from_secs(9));
}

#[test]
fn test_no_update_clock_before_first_wrap() {
    let mut avg = RateAverager::new(3);
    std::thread::sleep(ms(5));
    assert_eq!(avg.time_since_update(), Duration::ZERO);

    avg.push(ms(1));
    std::thread::sleep(ms(5));
    assert_eq!(avg.time_since_update(), Duration::ZERO);
    assert_eq!(avg.time_since_update(), RateAverager::default().time_since_update());
}

#[test]
fn test_reset() {
    let mut avg = RateAverager::new(2);
    avg.push(ms(10));
    avg.push(ms(10));
    avg.reset();

    assert!(!avg.average_ready());
    assert_eq!(avg.average(), Duration::ZERO);
    assert_eq!(avg.time_since_update(), Duration::ZERO);

    avg.push(ms(40));
    assert!(!avg.average_ready());
    avg.push(ms(60));
    assert_eq!(avg.average(), ms(50));
}

#[test]
fn test_zero_window_is_clamped() {
    let mut avg = RateAverager::new(0);
    assert_eq!(avg.window(), 1);
    avg.push(ms(7));
    assert!(avg.average_ready());
    assert_eq!(avg.average(), ms(7));
}
