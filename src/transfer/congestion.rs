use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct RttSample {
    min: Duration,
    last: Duration,
}

/// Minimum and latest round-trip time per connection.
#[derive(Debug)]
pub struct RttTracker {
    factor: u32,
    samples: HashMap<Uuid, RttSample>,
}

impl RttTracker {
    pub fn new(factor: u32) -> Self {
        Self {
            factor,
            samples: HashMap::new(),
        }
    }

    /// Records a sample; true when it exceeds `factor` times the minimum seen.
    pub fn observe(&mut self, conn: Uuid, rtt: Duration) -> bool {
        let sample = self.samples.entry(conn).or_insert(RttSample { min: rtt, last: rtt });
        sample.last = rtt;
        if rtt < sample.min {
            sample.min = rtt;
        }
        !sample.min.is_zero() && rtt > sample.min * self.factor
    }

    pub fn last(&self, conn: &Uuid) -> Option<Duration> {
        self.samples.get(conn).map(|s| s.last)
    }

    pub fn remove(&mut self, conn: &Uuid) {
        self.samples.remove(conn);
    }
}

/// Picks the connections to ask to back off. `ranked` lists upload
/// connections by data still missing, ascending; `flagged` is the index of the
/// congested one. A connection at rank `i` ahead of it is picked with
/// probability `(flagged - i) / (flagged + 1)`, so peers further ahead are more
/// likely to yield. The flagged connection is always picked.
pub fn select_congestion_targets<R: Rng>(
    ranked: &[Uuid],
    flagged: usize,
    rng: &mut R,
) -> Vec<Uuid> {
    if flagged >= ranked.len() {
        return Vec::new();
    }
    let mut targets = Vec::new();
    for (i, conn) in ranked.iter().enumerate().take(flagged) {
        let p = (flagged - i) as f64 / (flagged + 1) as f64;
        if rng.gen_bool(p) {
            targets.push(*conn);
        }
    }
    targets.push(ranked[flagged]);
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rtt_flagged_above_factor() {
        let mut tracker = RttTracker::new(8);
        let conn = Uuid::new_v4();
        assert!(!tracker.observe(conn, Duration::from_millis(10)));
        assert!(!tracker.observe(conn, Duration::from_millis(80)));
        assert!(tracker.observe(conn, Duration::from_millis(81)));
        assert!(!tracker.observe(conn, Duration::from_millis(5)));
        assert!(tracker.observe(conn, Duration::from_millis(41)));
    }

    #[test]
    fn test_flagged_always_targeted() {
        let ranked: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select_congestion_targets(&ranked, 0, &mut rng), vec![ranked[0]]);
        for _ in 0..100 {
            let targets = select_congestion_targets(&ranked, 3, &mut rng);
            assert_eq!(targets.last(), Some(&ranked[3]));
            assert!(!targets[..targets.len() - 1].contains(&ranked[3]));
        }
        assert!(select_congestion_targets(&ranked, 9, &mut rng).is_empty());
    }

    #[test]
    fn test_peers_further_ahead_yield_more_often() {
        let ranked: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits = [0u32; 3];
        let trials = 10_000;
        for _ in 0..trials {
            for conn in select_congestion_targets(&ranked, 3, &mut rng) {
                if let Some(i) = ranked[..3].iter().position(|c| *c == conn) {
                    hits[i] += 1;
                }
            }
        }
        // Expected rates 3/4, 2/4 and 1/4.
        let rate = |i: usize| hits[i] as f64 / trials as f64;
        assert!((rate(0) - 0.75).abs() < 0.03);
        assert!((rate(1) - 0.50).abs() < 0.03);
        assert!((rate(2) - 0.25).abs() < 0.03);
    }
}
