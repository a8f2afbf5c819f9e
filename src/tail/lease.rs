//! Cluster-wide leases for singleton background jobs.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A named, time-bounded exclusive claim.
///
/// A holder that crashes without releasing loses the lease once its TTL runs out.
pub trait Lease: Send + Sync {
    /// Take the lease if it is free, expired, or already ours.
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend our lease. Returns false if we no longer hold it.
    fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give the lease up. Releasing a lease held by someone else does nothing.
    fn release(&self, name: &str, holder: &str);
}

struct Claim {
    holder: String,
    expires: Instant,
}

/// Leases held in process memory.
pub struct MemoryLease {
    claims: Mutex<HashMap<String, Claim>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Current holder of `name`, if the lease is live.
    pub fn holder(&self, name: &str) -> Option<String> {
        let claims = self.claims.lock();
        claims
            .get(name)
            .filter(|c| c.expires > Instant::now())
            .map(|c| c.holder.clone())
    }
}

impl Default for MemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

impl Lease for MemoryLease {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock();
        if let Some(claim) = claims.get(name) {
            if claim.holder != holder && claim.expires > now {
                return Ok(false);
            }
            if claim.holder != holder {
                debug!(name, previous = %claim.holder, holder, "taking over expired lease");
            }
        }
        claims.insert(
            name.to_string(),
            Claim {
                holder: holder.to_string(),
                expires: now + ttl,
            },
        );
        Ok(true)
    }

    fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock();
        match claims.get_mut(name) {
            Some(claim) if claim.holder == holder && claim.expires > now => {
                claim.expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, name: &str, holder: &str) {
        let mut claims = self.claims.lock();
        if claims.get(name).is_some_and(|c| c.holder == holder) {
            claims.remove(name);
        }
    }
}
