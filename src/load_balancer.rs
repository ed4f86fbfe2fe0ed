//! Endpoint registry and selection strategies (spec §4.7).

use crate::endpoint::Endpoint;
use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

struct Registry {
    endpoints: Vec<Arc<Endpoint>>,
}

/// A handle returned by `next()`. `active` is only touched once `connect()`
/// has been called; dropping a connected lease without calling `release()`
/// still decrements `active` so a panicking caller can't leak the counter.
pub struct Lease {
    endpoint: Arc<Endpoint>,
    connected: bool,
    released: bool,
}

impl Lease {
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Marks a successful connect: increments `active`/`total` (spec §4.7:
    /// "the caller must call connect() which atomically increments...").
    pub fn connect(&mut self) {
        self.endpoint.stats.record_connect();
        self.connected = true;
    }

    pub fn release(mut self) {
        if self.connected {
            self.endpoint.stats.record_release();
        }
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released && self.connected {
            self.endpoint.stats.record_release();
        }
    }
}

/// Round-robin / weighted-round-robin / least-connections endpoint
/// selection over a registry of candidate peers.
pub struct LoadBalancer {
    strategy: Strategy,
    registry: RwLock<Registry>,
    rr_counter: AtomicUsize,
    health_check_interval: Duration,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, health_check_interval: Duration) -> Self {
        Self {
            strategy,
            registry: RwLock::new(Registry {
                endpoints: Vec::new(),
            }),
            rr_counter: AtomicUsize::new(0),
            health_check_interval,
        }
    }

    pub fn add_endpoint(&self, address: SocketAddr, weight: u32) {
        let mut reg = self.registry.write();
        reg.endpoints.push(Arc::new(Endpoint::new(address, weight)));
    }

    pub fn remove_endpoint(&self, address: SocketAddr) {
        let mut reg = self.registry.write();
        reg.endpoints.retain(|e| e.descriptor.address != address);
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.registry.read().endpoints.clone()
    }

    /// Select the next endpoint per the configured strategy, skipping
    /// endpoints whose failure_streak has crossed unhealthy_threshold until
    /// they accumulate healthy_threshold successes.
    pub fn next(&self) -> Result<Lease> {
        let reg = self.registry.read();
        if reg.endpoints.is_empty() {
            return Err(TunnelError::NoEndpointsAvailable);
        }
        let eligible: Vec<&Arc<Endpoint>> = reg
            .endpoints
            .iter()
            .filter(|e| e.is_healthy() || e.is_recovered())
            .collect();
        let pool = if eligible.is_empty() {
            // every endpoint is unhealthy and unrecovered: fail over to the
            // full set rather than refuse service entirely.
            reg.endpoints.iter().collect::<Vec<_>>()
        } else {
            eligible
        };

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.rr_counter.fetch_add(1, Ordering::SeqCst) % pool.len();
                pool[idx]
            }
            Strategy::WeightedRoundRobin => self.weighted_pick(&pool),
            Strategy::LeastConnections => pool
                .iter()
                .min_by_key(|e| e.stats.active())
                .expect("pool non-empty"),
        };

        Ok(Lease {
            endpoint: chosen.clone(),
            connected: false,
            released: false,
        })
    }

    /// Cycles through a virtual sequence of length Σweights so that over any
    /// full cycle each endpoint is chosen exactly `weight` times.
    fn weighted_pick<'a>(&self, pool: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let total_weight: u64 = pool.iter().map(|e| e.descriptor.weight as u64).sum();
        let n = self.rr_counter.fetch_add(1, Ordering::SeqCst) as u64 % total_weight.max(1);
        let mut acc = 0u64;
        for e in pool {
            acc += e.descriptor.weight as u64;
            if n < acc {
                return e;
            }
        }
        pool[pool.len() - 1]
    }

    /// Background liveness prober: periodically probes every registered
    /// endpoint with `probe` and updates its success/failure streak.
    pub async fn run_prober<F, Fut>(self: Arc<Self>, probe: F)
    where
        F: Fn(SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let mut ticker = tokio::time::interval(self.health_check_interval);
        loop {
            ticker.tick().await;
            for endpoint in self.endpoints() {
                let ok = probe(endpoint.descriptor.address).await;
                if ok {
                    endpoint.record_success();
                } else {
                    endpoint.record_failure("liveness probe failed");
                    warn!(address = %endpoint.descriptor.address, "endpoint probe failed");
                }
            }
            info!(count = self.endpoints().len(), "liveness probe cycle complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(strategy: Strategy) -> LoadBalancer {
        LoadBalancer::new(strategy, Duration::from_secs(30))
    }

    #[test]
    fn round_robin_rotates_through_all_endpoints() {
        let lb = lb(Strategy::RoundRobin);
        lb.add_endpoint("127.0.0.1:8001".parse().unwrap(), 1);
        lb.add_endpoint("127.0.0.1:8002".parse().unwrap(), 1);
        lb.add_endpoint("127.0.0.1:8003".parse().unwrap(), 1);

        let seq: Vec<u16> = (0..6)
            .map(|_| lb.next().unwrap().endpoint().descriptor.address.port())
            .collect();
        assert_eq!(seq, vec![8001, 8002, 8003, 8001, 8002, 8003]);
    }

    #[test]
    fn weighted_round_robin_matches_weight_distribution() {
        let lb = lb(Strategy::WeightedRoundRobin);
        lb.add_endpoint("127.0.0.1:8001".parse().unwrap(), 2);
        lb.add_endpoint("127.0.0.1:8002".parse().unwrap(), 1);

        let mut count_a = 0;
        let mut count_b = 0;
        for _ in 0..30 {
            let lease = lb.next().unwrap();
            match lease.endpoint().descriptor.address.port() {
                8001 => count_a += 1,
                8002 => count_b += 1,
                _ => unreachable!(),
            }
        }
        assert_eq!(count_a, 20);
        assert_eq!(count_b, 10);
    }

    #[test]
    fn least_connections_picks_smallest_active_count() {
        let lb = lb(Strategy::LeastConnections);
        lb.add_endpoint("127.0.0.1:8001".parse().unwrap(), 1);
        lb.add_endpoint("127.0.0.1:8002".parse().unwrap(), 1);

        let mut lease1 = lb.next().unwrap();
        lease1.connect();
        // 8001 now has 1 active; next() must prefer 8002.
        let mut lease2 = lb.next().unwrap();
        lease2.connect();
        assert_ne!(
            lease1.endpoint().descriptor.address,
            lease2.endpoint().descriptor.address
        );
    }

    #[test]
    fn next_on_empty_registry_fails() {
        let lb = lb(Strategy::RoundRobin);
        assert!(matches!(lb.next(), Err(TunnelError::NoEndpointsAvailable)));
    }

    #[test]
    fn unhealthy_endpoint_is_skipped_until_recovered() {
        let lb = lb(Strategy::RoundRobin);
        lb.add_endpoint("127.0.0.1:8001".parse().unwrap(), 1);
        lb.add_endpoint("127.0.0.1:8002".parse().unwrap(), 1);
        let unhealthy = lb.endpoints()[0].clone();
        for _ in 0..unhealthy.unhealthy_threshold {
            unhealthy.record_failure("down");
        }
        assert!(!unhealthy.is_healthy());

        for _ in 0..10 {
            let lease = lb.next().unwrap();
            assert_ne!(lease.endpoint().descriptor.address.port(), 8001);
        }
    }
}
