use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Inbound loss and latency applied per connection before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkSimulation {
    pub loss_chance: f32,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl NetworkSimulation {
    pub fn new(loss_chance: f32, min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            loss_chance: loss_chance.clamp(0.0, 1.0),
            min_latency,
            max_latency: max_latency.max(min_latency),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.loss_chance > 0.0 || !self.max_latency.is_zero()
    }

    pub fn should_drop(&self) -> bool {
        if self.loss_chance <= 0.0 {
            return false;
        }
        self.loss_chance >= 1.0 || rand::thread_rng().r#gen::<f32>() < self.loss_chance
    }

    pub fn delay(&self) -> Duration {
        if self.max_latency <= self.min_latency {
            return self.min_latency;
        }
        let span = (self.max_latency - self.min_latency).as_nanos() as u64;
        self.min_latency + Duration::from_nanos(rand::thread_rng().gen_range(0..=span))
    }
}

/// FIFO of items released once their due time passes.
///
/// Items are scanned in insertion order, so an item with a short delay
/// queued behind a longer one is still released on its own due time.
#[derive(Debug)]
pub struct LatencyQueue<T> {
    queue: VecDeque<(Instant, T)>,
}

impl<T> Default for LatencyQueue<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T> LatencyQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, due: Instant, item: T) {
        self.queue.push_back((due, item));
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let mut released = Vec::new();
        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].0 <= now {
                if let Some((_, item)) = self.queue.remove(i) {
                    released.push(item);
                }
            } else {
                i += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_extremes() {
        let never = NetworkSimulation::new(0.0, Duration::ZERO, Duration::ZERO);
        let always = NetworkSimulation::new(1.0, Duration::ZERO, Duration::ZERO);
        for _ in 0..100 {
            assert!(!never.should_drop());
            assert!(always.should_drop());
        }
        assert!(!never.is_enabled());
        assert!(always.is_enabled());
    }

    #[test]
    fn test_delay_within_bounds() {
        let sim = NetworkSimulation::new(0.0, Duration::from_millis(20), Duration::from_millis(40));
        for _ in 0..100 {
            let delay = sim.delay();
            assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(40));
        }

        let fixed = NetworkSimulation::new(0.0, Duration::from_millis(5), Duration::ZERO);
        assert_eq!(fixed.delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_queue_releases_by_due_time_in_insertion_order() {
        let now = Instant::now();
        let mut queue = LatencyQueue::new();
        queue.push(now + Duration::from_millis(30), "slow");
        queue.push(now + Duration::from_millis(10), "fast");
        queue.push(now, "instant");

        assert_eq!(queue.take_due(now), vec!["instant"]);
        assert_eq!(queue.take_due(now + Duration::from_millis(10)), vec!["fast"]);
        assert_eq!(queue.take_due(now + Duration::from_millis(50)), vec!["slow"]);
        assert!(queue.is_empty());
    }
}
