use chrono::{DateTime, Local, Timelike, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Hour of day (0-23) in the service's local time zone.
    fn local_hour(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_hour(&self) -> u32 {
        Local::now().hour()
    }
}

/// Daily hour range, both ends inclusive, during which capacity is reserved
/// for interactive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl PeakWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour <= self.end_hour
        } else {
            // wraps past midnight, e.g. 20..=3
            hour >= self.start_hour || hour <= self.end_hour
        }
    }

    pub fn effective_ceiling(&self, max_concurrent: usize, hour: u32) -> usize {
        if self.contains(hour) {
            max_concurrent.saturating_sub(1).max(1)
        } else {
            max_concurrent.max(1)
        }
    }
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 22,
        }
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{DateTime, Utc};

    use super::Clock;

    /// Real wall-clock time with a pinned hour of day.
    #[derive(Debug)]
    pub struct ManualClock {
        hour: AtomicU32,
    }

    impl ManualClock {
        pub fn at_hour(hour: u32) -> Self {
            Self {
                hour: AtomicU32::new(hour),
            }
        }

        pub fn set_hour(&self, hour: u32) {
            self.hour.store(hour, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn local_hour(&self) -> u32 {
            self.hour.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PeakWindow;

    #[test]
    fn default_window_covers_nine_through_twenty_two() {
        let window = PeakWindow::default();
        assert!(!window.contains(8));
        assert!(window.contains(9));
        assert!(window.contains(22));
        assert!(!window.contains(23));
    }

    #[test]
    fn window_may_wrap_midnight() {
        let window = PeakWindow {
            start_hour: 22,
            end_hour: 2,
        };
        assert!(window.contains(23));
        assert!(window.contains(0));
        assert!(window.contains(2));
        assert!(!window.contains(12));
    }

    #[test]
    fn ceiling_shrinks_by_one_but_never_below_one() {
        let window = PeakWindow::default();
        assert_eq!(window.effective_ceiling(3, 12), 2);
        assert_eq!(window.effective_ceiling(3, 3), 3);
        assert_eq!(window.effective_ceiling(1, 12), 1);
    }
}
