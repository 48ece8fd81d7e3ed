use std::time::{Duration, Instant};

/// Fraction of a frame's delta the follower clock may be nudged by.
const MAX_CLOCK_NUDGE: f64 = 0.1;

/// Shared session time in seconds.
///
/// The host is authoritative and reads time straight from its start
/// instant. Clients follow: the first sync snaps, later syncs only move a
/// target that the local clock is nudged toward each frame.
#[derive(Debug, Clone)]
pub struct NetClock {
    started_at: Instant,
    authoritative: bool,
    synced: bool,
    current: f64,
    desired: f64,
    last_host_time: Option<f64>,
}

impl NetClock {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            authoritative: false,
            synced: false,
            current: 0.0,
            desired: 0.0,
            last_host_time: None,
        }
    }

    pub fn start_authority(&mut self, now: Instant) {
        *self = Self::new(now);
        self.authoritative = true;
        self.synced = true;
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn time(&self, now: Instant) -> f64 {
        if self.authoritative {
            now.saturating_duration_since(self.started_at).as_secs_f64()
        } else {
            self.current
        }
    }

    pub fn desired(&self) -> f64 {
        self.desired
    }

    /// Applies a host timestamp. Stale or repeated timestamps are ignored.
    pub fn apply_sync(&mut self, host_time: f64, rtt: Duration) -> bool {
        if self.authoritative {
            return false;
        }
        if self.last_host_time.is_some_and(|last| host_time <= last) {
            return false;
        }
        self.last_host_time = Some(host_time);

        let target = host_time + rtt.as_secs_f64() * 0.5;
        if !self.synced {
            self.current = target;
            self.synced = true;
        }
        self.desired = target;
        true
    }

    pub fn advance(&mut self, delta: Duration) {
        if self.authoritative {
            return;
        }
        let dt = delta.as_secs_f64();
        self.current += dt;
        self.desired += dt;

        let max_step = dt * MAX_CLOCK_NUDGE;
        let error = self.desired - self.current;
        self.current += error.clamp(-max_step, max_step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_reads_elapsed() {
        let now = Instant::now();
        let mut clock = NetClock::new(now);
        clock.start_authority(now);
        let later = now + Duration::from_millis(1500);
        assert!((clock.time(later) - 1.5).abs() < 1e-9);
        assert!(!clock.apply_sync(100.0, Duration::ZERO));
    }

    #[test]
    fn test_first_sync_snaps() {
        let now = Instant::now();
        let mut clock = NetClock::new(now);
        assert!(clock.apply_sync(10.0, Duration::from_millis(100)));
        assert!((clock.time(now) - 10.05).abs() < 1e-9);
    }

    #[test]
    fn test_later_sync_nudges() {
        let now = Instant::now();
        let mut clock = NetClock::new(now);
        clock.apply_sync(10.0, Duration::ZERO);
        clock.apply_sync(11.0, Duration::ZERO);

        clock.advance(Duration::from_millis(100));
        assert!((clock.time(now) - 10.11).abs() < 1e-9);
        assert!((clock.desired() - 11.1).abs() < 1e-9);

        for _ in 0..200 {
            clock.advance(Duration::from_millis(100));
        }
        assert!((clock.time(now) - clock.desired()).abs() < 1e-9);
    }

    #[test]
    fn test_stale_sync_ignored() {
        let now = Instant::now();
        let mut clock = NetClock::new(now);
        assert!(clock.apply_sync(5.0, Duration::ZERO));
        assert!(!clock.apply_sync(5.0, Duration::ZERO));
        assert!(!clock.apply_sync(4.0, Duration::ZERO));
        assert!((clock.desired() - 5.0).abs() < 1e-9);
    }
}
