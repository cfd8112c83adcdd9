use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;

use crate::model::AccessCredential;

/// Stays under the marshal's 30 minute token lifetime.
pub const CREDENTIAL_VALIDITY: Duration = Duration::from_secs(20 * 60);

pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock driven by hand, for tests and replays.
#[derive(Default)]
pub struct ManualClock(Cell<u64>);

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self(Cell::new(now_ms))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.set(now_ms);
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by.as_millis() as u64);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

pub struct SignatureCache {
    credential: Option<AccessCredential>,
    validity: Duration,
    force_refresh: bool,
}

/// Process-wide cache handle. Only the credential broker writes it.
pub type SharedSignatureCache = Rc<Mutex<SignatureCache>>;

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(CREDENTIAL_VALIDITY)
    }
}

impl SignatureCache {
    pub fn new(validity: Duration) -> Self {
        Self {
            credential: None,
            validity,
            force_refresh: false,
        }
    }

    pub fn shared(validity: Duration) -> SharedSignatureCache {
        Rc::new(Mutex::new(Self::new(validity)))
    }

    pub fn is_valid(&self, now_ms: u64) -> bool {
        match &self.credential {
            Some(cred) if !self.force_refresh => {
                let age = now_ms.saturating_sub(cred.issued_at_ms);
                u128::from(age) < self.validity.as_millis()
            }
            _ => false,
        }
    }

    /// Cached credential, only while still valid.
    pub fn get(&self, now_ms: u64) -> Option<&AccessCredential> {
        if self.is_valid(now_ms) {
            self.credential.as_ref()
        } else {
            None
        }
    }

    pub fn peek(&self) -> Option<&AccessCredential> {
        self.credential.as_ref()
    }

    pub fn store(&mut self, credential: AccessCredential) {
        self.credential = Some(credential);
        self.force_refresh = false;
    }

    pub fn invalidate(&mut self) {
        self.force_refresh = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Nonce;

    fn cred(issued_at_ms: u64) -> AccessCredential {
        AccessCredential {
            nonce: Nonce::parse("n-1").unwrap(),
            signature: "sig".into(),
            issued_at_ms,
        }
    }

    #[test]
    fn empty_cache_is_invalid() {
        let cache = SignatureCache::default();
        assert!(!cache.is_valid(0));
        assert!(cache.get(0).is_none());
    }

    #[test]
    fn validity_window_edges() {
        let t0 = 1_700_000_000_000;
        let mut cache = SignatureCache::default();
        cache.store(cred(t0));

        let just_before = t0 + (19 * 60 + 59) * 1000;
        let just_after = t0 + (20 * 60 + 1) * 1000;
        assert!(cache.is_valid(just_before));
        assert!(!cache.is_valid(just_after));
        assert!(!cache.is_valid(t0 + 20 * 60 * 1000));
    }

    #[test]
    fn invalidate_until_next_store() {
        let mut cache = SignatureCache::default();
        cache.store(cred(10));
        cache.invalidate();
        assert!(!cache.is_valid(10));
        assert!(cache.peek().is_some());

        cache.store(cred(20));
        assert!(cache.is_valid(20));
    }

    #[test]
    fn clock_skew_counts_as_fresh() {
        let mut cache = SignatureCache::default();
        cache.store(cred(5_000));
        assert!(cache.is_valid(1_000));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ms(), 2_100);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
    }
}
