use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::sync::Mutex;

/// Hands out strictly increasing UTC timestamps.
///
/// Wall clock steps backwards, or two records landing in the same
/// microsecond, still produce a total order.
#[derive(Debug, Default)]
pub struct RecordClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl RecordClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Microsecond precision, matching how records are stored
    pub fn now(&self) -> DateTime<Utc> {
        self.next_after(Utc::now().trunc_subsecs(6))
    }

    fn next_after(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        // A poisoned lock still holds a valid timestamp
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match *last {
            Some(prev) if wall <= prev => prev + Duration::microseconds(1),
            _ => wall,
        };
        *last = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let clock = RecordClock::new();
        let stamps: Vec<_> = (0..1000).map(|_| clock.now()).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn clock_going_backwards_is_absorbed() {
        let clock = RecordClock::new();
        let now = Utc::now();
        let first = clock.next_after(now);
        let second = clock.next_after(now - Duration::seconds(30));
        assert!(second > first);
    }
}
