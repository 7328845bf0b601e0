//! Periodic liveness sweep over the node registry.

use std::sync::Arc;

use crate::master::{NodeId, NodeRegistry};
use crate::utils::DfsError;

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Evicts nodes whose heartbeat has lapsed, once per sweep interval.
pub struct Sweeper {
    registry: Arc<NodeRegistry>,

    /// Ticking interval; missed ticks are skipped rather than bursted.
    ticker: Interval,
}

impl Sweeper {
    /// Creates a new sweeper. Must be called within a tokio runtime. The
    /// sweep interval must be shorter than the registry's heartbeat timeout,
    /// otherwise stale nodes would linger for longer than the timeout.
    pub fn new_and_setup(
        registry: Arc<NodeRegistry>,
        sweep_interval: Duration,
    ) -> Result<Self, DfsError> {
        if sweep_interval.is_zero()
            || sweep_interval >= registry.heartbeat_timeout()
        {
            return logged_err!(
                "invalid sweep interval {:?} for heartbeat timeout {:?}",
                sweep_interval,
                registry.heartbeat_timeout()
            );
        }

        let mut ticker =
            time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Sweeper { registry, ticker })
    }

    /// Waits for the next sweep tick. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Runs a single sweep as of `now`, returning the evicted nodes.
    pub fn step(&self, now: Instant) -> Vec<NodeId> {
        let evicted = self.registry.sweep(now);
        for node in &evicted {
            pf_warn!("node timeout, evicted: {}", node);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn invalid_interval() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(10)));
        assert!(Sweeper::new_and_setup(registry.clone(), Duration::ZERO).is_err());
        assert!(Sweeper::new_and_setup(registry, Duration::from_secs(10)).is_err());
    }

    #[tokio::test]
    async fn single_step() -> Result<(), DfsError> {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(10)));
        let sweeper =
            Sweeper::new_and_setup(registry.clone(), Duration::from_secs(2))?;
        let t0 = Instant::now();
        registry.register_at("node1", SocketAddr::from(([127, 0, 0, 1], 1)), t0);
        registry.register_at("node2", SocketAddr::from(([127, 0, 0, 1], 2)), t0);
        registry.heartbeat_at("node2", t0 + Duration::from_secs(8));

        assert!(sweeper.step(t0 + Duration::from_secs(9)).is_empty());
        assert_eq!(sweeper.step(t0 + Duration::from_secs(12)), vec!["node1"]);
        assert_eq!(registry.active_nodes(), vec!["node2"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticking_evicts() -> Result<(), DfsError> {
        let registry = Arc::new(NodeRegistry::new(Duration::from_millis(200)));
        let mut sweeper =
            Sweeper::new_and_setup(registry.clone(), Duration::from_millis(50))?;
        registry.register("node1", SocketAddr::from(([127, 0, 0, 1], 1)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !registry.is_empty() && Instant::now() < deadline {
            sweeper.tick().await;
            sweeper.step(Instant::now());
        }
        assert!(registry.is_empty());
        Ok(())
    }
}
