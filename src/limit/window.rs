use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::quota::RateQuota;

/// Sliding-window counter for one (scope, identifier) pair.
///
/// The representation is a timestamp deque: at admission time samples older
/// than `now - window` are evicted, then `count + 1 <= limit` is tested and,
/// on success, `now` is inserted. After every decision the invariant
/// `count(window) <= limit` holds.
///
/// The critical section is a handful of deque operations; the std `Mutex`
/// is never held across an await point.
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    samples: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(quota: RateQuota) -> Self {
        debug_assert!(!quota.is_unlimited(), "unlimited quotas are not allocated");
        Self {
            limit: quota.limit,
            window: quota.window,
            samples: Mutex::new(VecDeque::with_capacity(quota.limit as usize)),
        }
    }

    fn evict(samples: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(front) = samples.front() {
            if now.duration_since(*front) >= window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit one request: evict, test, insert. Returns `false` when the
    /// window has no headroom.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::evict(&mut samples, self.window, now);
        if samples.len() < self.limit as usize {
            samples.push_back(now);
            true
        } else {
            false
        }
    }

    /// Whether an admission would currently succeed, without consuming it.
    pub fn would_admit(&self) -> bool {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::evict(&mut samples, self.window, now);
        samples.len() < self.limit as usize
    }

    /// The earliest instant at which the next admission can succeed.
    /// `None` means the window has headroom right now.
    pub fn earliest_admit(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::evict(&mut samples, self.window, now);
        if samples.len() < self.limit as usize {
            None
        } else {
            samples.front().map(|front| *front + self.window)
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        Self::evict(&mut samples, self.window, now);
        samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(s: &str) -> RateQuota {
        s.parse().unwrap()
    }

    #[test]
    fn admits_up_to_limit() {
        let w = SlidingWindow::new(quota("3/h"));
        assert!(w.try_acquire());
        assert!(w.try_acquire());
        assert!(w.try_acquire());
        assert!(!w.try_acquire());
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn earliest_admit_is_front_plus_window() {
        let w = SlidingWindow::new(quota("1/h"));
        assert!(w.earliest_admit().is_none());
        let before = Instant::now();
        assert!(w.try_acquire());
        let at = w.earliest_admit().expect("window is full");
        let dt = at.duration_since(before);
        assert!(dt <= Duration::from_secs(3_600));
        assert!(dt > Duration::from_secs(3_590));
    }

    #[test]
    fn samples_expire() {
        let w = SlidingWindow::new(RateQuota {
            limit: 1,
            window: Duration::from_millis(20),
        });
        assert!(w.try_acquire());
        assert!(!w.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(w.try_acquire());
    }

    #[test]
    fn would_admit_does_not_consume() {
        let w = SlidingWindow::new(quota("1/h"));
        assert!(w.would_admit());
        assert!(w.would_admit());
        assert!(w.try_acquire());
        assert!(!w.would_admit());
    }
}
