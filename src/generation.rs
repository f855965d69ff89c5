//! Configuration generations and their atomic replacement.
//!
//! A [`Generation`] owns everything derived from one mesh snapshot: the
//! cluster registries, compiled route trees with their balancers, the egress
//! selector and the upstream connection pool. Requests pin one generation
//! for their whole lifetime, so a reload never mixes old and new state.

use crate::egress::EgressSelector;
use crate::error::ConfigError;
use crate::mesh::MeshConfig;
use crate::router::{Direction, Router};
use crate::transport::UpstreamPool;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything derived from one configuration snapshot.
pub struct Generation {
    id: u64,
    service_identity: String,
    inbound: Router,
    outbound: Router,
    egress: EgressSelector,
    pool: UpstreamPool,
}

impl Generation {
    /// Compiles a snapshot. Regexes, CIDRs, retry tables and certificate
    /// material are all validated here.
    pub fn build(id: u64, config: &MeshConfig) -> Result<Self, ConfigError> {
        let inbound = Router::build(
            Direction::Inbound,
            config.inbound.as_ref(),
            &config.service_identity,
        )?;
        let outbound = Router::build(
            Direction::Outbound,
            config.outbound.as_ref(),
            &config.service_identity,
        )?;
        let egress = EgressSelector::build(config)?;

        Ok(Self {
            id,
            service_identity: config.service_identity.clone(),
            inbound,
            outbound,
            egress,
            pool: UpstreamPool::new(),
        })
    }

    /// Returns the generation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the identity of the fronted workload.
    pub fn service_identity(&self) -> &str {
        &self.service_identity
    }

    /// Returns the router of a direction.
    pub fn router(&self, direction: Direction) -> &Router {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn egress(&self) -> &EgressSelector {
        &self.egress
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }
}

/// Holder of the active generation.
pub struct GenerationStore {
    current: ArcSwap<Generation>,
    next_id: AtomicU64,
}

impl GenerationStore {
    /// Builds the first generation.
    pub fn new(config: &MeshConfig) -> Result<Self, ConfigError> {
        let generation = Generation::build(1, config)?;
        info!(
            generation = 1,
            inbound_ports = generation.inbound.len(),
            outbound_ports = generation.outbound.len(),
            "activated configuration generation"
        );
        Ok(Self {
            current: ArcSwap::from_pointee(generation),
            next_id: AtomicU64::new(2),
        })
    }

    /// Returns the active generation.
    pub fn load(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Returns the id of the active generation.
    pub fn current_id(&self) -> u64 {
        self.current.load().id
    }

    /// Builds a new generation and swaps it in. On failure the active
    /// generation is left untouched.
    pub fn reload(&self, config: &MeshConfig) -> Result<u64, ConfigError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = match Generation::build(id, config) {
            Ok(generation) => generation,
            Err(e) => {
                warn!(
                    generation = id,
                    active = self.current_id(),
                    error = %e,
                    "configuration rejected, keeping active generation"
                );
                return Err(e);
            }
        };

        let previous = self.current.swap(Arc::new(generation));
        info!(
            generation = id,
            previous = previous.id,
            "activated configuration generation"
        );
        Ok(id)
    }

    /// Reads a snapshot from disk and reloads it.
    pub fn reload_from_file(&self, path: &Path) -> Result<u64, ConfigError> {
        let config = MeshConfig::from_file(path)?;
        self.reload(&config)
    }
}
