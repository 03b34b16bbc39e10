use std::sync::Arc;

use crate::backend::HttpBackend;
use crate::gateway::{GatewayClient, ReconnectPolicy};

/// Where the server lives and who we are on it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://` or `https://` origin of the server, without a trailing slash
    pub base_url: String,
    /// JWT from `/auth/login` or `/auth/register`
    pub token: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn backend(&self) -> HttpBackend {
        HttpBackend::new(&self.base_url, &self.token)
    }

    /// A gateway handle to share between the controllers. Not yet connected.
    pub fn gateway(&self) -> Arc<GatewayClient> {
        Arc::new(GatewayClient::new(
            &self.base_url,
            &self.token,
            self.reconnect.clone(),
        ))
    }
}
