use std::time::Duration;

use url::Url;

use crate::{args::MarshalplayArgs, cache::CREDENTIAL_VALIDITY, error::AccessError, model::ChainId};

/// Marshal tokens expire after 30 minutes.
const SERVICE_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug)]
pub struct MarshalConfig {
    pub marshal_url: String,
    pub chain: ChainId,
    pub credential_validity: Duration,
    pub prefetch_limit: usize,
    pub connect_timeout: Duration,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            marshal_url: "http://127.0.0.1:8080".into(),
            chain: ChainId::Devnet,
            credential_validity: CREDENTIAL_VALIDITY,
            prefetch_limit: 6,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl MarshalConfig {
    pub fn from_args(args: &MarshalplayArgs) -> Result<Self, AccessError> {
        let config = Self {
            marshal_url: args.marshal_url.clone(),
            chain: args.chain,
            credential_validity: Duration::from_secs(args.validity_secs),
            prefetch_limit: args.prefetch_limit,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AccessError> {
        let url = Url::parse(&self.marshal_url)
            .map_err(|err| AccessError::InvalidConfig(format!("marshal url: {}", err)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AccessError::InvalidConfig(format!(
                "marshal url scheme: {}",
                url.scheme()
            )));
        }
        if self.credential_validity.is_zero()
            || self.credential_validity >= SERVICE_TOKEN_LIFETIME
        {
            return Err(AccessError::InvalidConfig(
                "credential validity must be between 1s and 30min".into(),
            ));
        }
        if self.prefetch_limit == 0 {
            return Err(AccessError::InvalidConfig("prefetch limit must be >= 1".into()));
        }
        Ok(())
    }

    pub fn http_client(&self) -> Result<reqwest::Client, AccessError> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|err| AccessError::InvalidConfig(err.to_string()))
    }
}
