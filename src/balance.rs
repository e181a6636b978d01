//! Load balancing over a service's location set.
//!
//! Two strategies: uniform random, and per-service round-robin whose counter
//! is seeded at a random index on first observation so a fresh registry does
//! not always hand out the first location.

use std::collections::HashMap;

use rand::Rng;

use crate::error::YamfError;

/// Selection strategy for picking one location out of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Uniform choice over the location set.
    #[default]
    Random,
    /// Per-service monotonic counter mod |locations|, randomly seeded.
    RoundRobin,
}

/// Per-service round-robin counters plus the random strategy.
///
/// Counters live for the owning process only; a restart reseeds them.
#[derive(Debug, Default)]
pub struct Balancer {
    counters: HashMap<String, usize>,
}

impl Balancer {
    pub fn new() -> Self {
        Balancer::default()
    }

    /// Select one location for `service` out of `locations`.
    ///
    /// The returned index is into `locations`; an empty set is a
    /// `NotFound` (there is no instance to route to).
    pub fn select<'a>(
        &mut self,
        service: &str,
        locations: &'a [String],
        strategy: Strategy,
    ) -> crate::Result<&'a str> {
        if locations.is_empty() {
            return Err(YamfError::NotFound(format!("no-such-service: '{service}'")));
        }
        let index = match strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..locations.len()),
            Strategy::RoundRobin => {
                let counter = self
                    .counters
                    .entry(service.to_string())
                    .or_insert_with(|| rand::thread_rng().gen_range(0..locations.len()));
                let index = *counter % locations.len();
                *counter = counter.wrapping_add(1);
                index
            }
        };
        Ok(locations[index].as_str())
    }

    /// Drop the counter for a service (when its last location goes away).
    pub fn forget(&mut self, service: &str) {
        self.counters.remove(service);
    }
}

/// Stateless uniform choice, for callers that never need round-robin
/// (the gateway's route proxy, a service's local cache selection).
pub fn pick_random<'a>(service: &str, locations: &'a [String]) -> crate::Result<&'a str> {
    if locations.is_empty() {
        return Err(YamfError::NotFound(format!("no-such-service: '{service}'")));
    }
    let index = rand::thread_rng().gen_range(0..locations.len());
    Ok(locations[index].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn locations(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_set_is_not_found() {
        let mut balancer = Balancer::new();
        let result = balancer.select("ghost", &[], Strategy::Random);
        assert!(matches!(result, Err(YamfError::NotFound(msg)) if msg.contains("ghost")));
    }

    #[test]
    fn test_single_location_always_selected() {
        let mut balancer = Balancer::new();
        let locs = locations(&["http://h:1"]);
        for _ in 0..10 {
            assert_eq!(
                balancer.select("svc", &locs, Strategy::RoundRobin).unwrap(),
                "http://h:1"
            );
        }
    }

    #[test]
    fn test_round_robin_uniform_distribution() {
        // 15 selections over 3 locations must hit each exactly 5 times,
        // regardless of the random seed.
        let mut balancer = Balancer::new();
        let locs = locations(&["http://h:1", "http://h:2", "http://h:3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..15 {
            let chosen = balancer.select("svc", &locs, Strategy::RoundRobin).unwrap();
            *counts.entry(chosen.to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for (location, count) in counts {
            assert_eq!(count, 5, "uneven selection for {location}");
        }
    }

    #[test]
    fn test_round_robin_covers_all_locations() {
        let mut balancer = Balancer::new();
        let locs = locations(&["http://h:1", "http://h:2", "http://h:3", "http://h:4"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..locs.len() {
            seen.insert(
                balancer
                    .select("svc", &locs, Strategy::RoundRobin)
                    .unwrap()
                    .to_string(),
            );
        }
        assert_eq!(seen.len(), locs.len(), "K = |L| lookups must cover every location");
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let mut balancer = Balancer::new();
        let locs_a = locations(&["http://a:1", "http://a:2"]);
        let locs_b = locations(&["http://b:1", "http://b:2"]);
        // Interleaved selections still alternate within each service.
        let a1 = balancer.select("a", &locs_a, Strategy::RoundRobin).unwrap().to_string();
        let b1 = balancer.select("b", &locs_b, Strategy::RoundRobin).unwrap().to_string();
        let a2 = balancer.select("a", &locs_a, Strategy::RoundRobin).unwrap().to_string();
        let b2 = balancer.select("b", &locs_b, Strategy::RoundRobin).unwrap().to_string();
        assert_ne!(a1, a2);
        assert_ne!(b1, b2);
    }

    #[test]
    fn test_random_selects_within_set() {
        let mut balancer = Balancer::new();
        let locs = locations(&["http://h:1", "http://h:2"]);
        for _ in 0..20 {
            let chosen = balancer.select("svc", &locs, Strategy::Random).unwrap();
            assert!(locs.iter().any(|l| l == chosen));
        }
    }

    #[test]
    fn test_pick_random_empty_is_not_found() {
        assert!(matches!(
            pick_random("ghost", &[]),
            Err(YamfError::NotFound(_))
        ));
    }

    #[test]
    fn test_pick_random_stays_in_set() {
        let locs = locations(&["http://h:1", "http://h:2", "http://h:3"]);
        for _ in 0..30 {
            let chosen = pick_random("svc", &locs).unwrap();
            assert!(locs.iter().any(|l| l == chosen));
        }
    }

    #[test]
    fn test_forget_reseeds_counter() {
        let mut balancer = Balancer::new();
        let locs = locations(&["http://h:1", "http://h:2", "http://h:3"]);
        balancer.select("svc", &locs, Strategy::RoundRobin).unwrap();
        balancer.forget("svc");
        // After forgetting, selection still works and stays in range.
        let chosen = balancer.select("svc", &locs, Strategy::RoundRobin).unwrap();
        assert!(locs.iter().any(|l| l == chosen));
    }
}
