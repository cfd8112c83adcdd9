use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use tracing::{debug, info, warn};

use crate::{
    cache::{Clock, SharedSignatureCache},
    error::AccessError,
    marshal::PreaccessSource,
    model::AccessCredential,
    signer::{SignError, WalletSigner},
};

/// Produces (nonce, signature) credentials, preferring the shared cache.
///
/// Refreshes are serialized: the cache lock is held from the validity
/// check until the round settles. Callers queued behind a round take its
/// outcome, a stored credential or the round's error, instead of
/// prompting the wallet again.
pub struct CredentialBroker {
    cache: SharedSignatureCache,
    preaccess: Rc<dyn PreaccessSource>,
    signer: Option<Rc<dyn WalletSigner>>,
    clock: Rc<dyn Clock>,
    /// Settled refresh rounds, success or failure.
    rounds: Cell<u64>,
    last_failure: RefCell<Option<AccessError>>,
}

impl CredentialBroker {
    pub fn new(
        cache: SharedSignatureCache,
        preaccess: Rc<dyn PreaccessSource>,
        signer: Option<Rc<dyn WalletSigner>>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            preaccess,
            signer,
            clock,
            rounds: Cell::new(0),
            last_failure: RefCell::new(None),
        }
    }

    pub fn cache(&self) -> &SharedSignatureCache {
        &self.cache
    }

    pub fn requester_address(&self) -> Result<String, AccessError> {
        self.signer
            .as_ref()
            .map(|s| s.address())
            .ok_or(AccessError::MissingSigningCapability)
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.invalidate();
    }

    pub async fn get_or_refresh(&self, force_new: bool) -> Result<AccessCredential, AccessError> {
        let seen = self.rounds.get();
        let mut cache = self.cache.lock().await;

        if !force_new {
            if let Some(cred) = cache.get(self.clock.now_ms()) {
                debug!(nonce = %cred.nonce, "credential cache hit");
                return Ok(cred.clone());
            }
        }

        // a round settled while we were queued
        if self.rounds.get() != seen {
            if let Some(err) = self.last_failure.borrow().clone() {
                debug!("sharing failed refresh: {}", err);
                return Err(err);
            }
        }

        let result = self.refresh(force_new).await;
        self.rounds.set(self.rounds.get() + 1);
        match result {
            Ok(credential) => {
                self.last_failure.replace(None);
                cache.store(credential.clone());
                Ok(credential)
            }
            Err(err) => {
                self.last_failure.replace(Some(err.clone()));
                Err(err)
            }
        }
    }

    async fn refresh(&self, force_new: bool) -> Result<AccessCredential, AccessError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or(AccessError::MissingSigningCapability)?;

        let nonce = self.preaccess.preaccess().await.map_err(|err| {
            warn!("preaccess failed: {}", err);
            match err {
                AccessError::PreaccessUnavailable(_) => err,
                other => AccessError::PreaccessUnavailable(other.to_string()),
            }
        })?;

        let raw = signer
            .sign_message(nonce.as_str().as_bytes())
            .await
            .map_err(|err| {
                warn!("nonce signing failed: {}", err);
                match err {
                    SignError::Declined(msg) | SignError::Failed(msg) => {
                        AccessError::SignatureDenied(msg)
                    }
                }
            })?;

        let credential = AccessCredential {
            nonce,
            signature: bs58::encode(raw).into_string(),
            issued_at_ms: self.clock.now_ms(),
        };
        info!(nonce = %credential.nonce, forced = force_new, "credential refreshed");
        Ok(credential)
    }
}
