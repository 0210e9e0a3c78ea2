use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory set of revoked access-token ids. An entry lives exactly as long as the token
/// it shadows would have, so the map never outgrows the set of still-valid revoked tokens.
///
/// Absence means "not known to be revoked"; signature and expiry are checked elsewhere.
#[derive(Clone, Default)]
pub struct RevocationCache {
    entries: Arc<DashMap<String, Instant>>,
}

impl RevocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `jti` as revoked for `remaining_secs`. Non-positive lifetimes record nothing:
    /// the token is already unusable.
    pub fn revoke(&self, jti: &str, remaining_secs: i64) {
        if remaining_secs <= 0 {
            return;
        }
        self.purge_expired();
        let deadline = Instant::now() + Duration::from_secs(remaining_secs as u64);
        self.entries.insert(jti.to_string(), deadline);
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        let live = match self.entries.get(jti) {
            Some(deadline) => *deadline > Instant::now(),
            None => return false,
        };
        if !live {
            self.entries.remove_if(jti, |_, deadline| *deadline <= Instant::now());
        }
        live
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, deadline| *deadline > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
