//! Call bootstrap over the catalog server's HTTP API.
//!
//! `POST /api/call/start` hands out a call id; the duplex stream for that call
//! lives at `ws(s)://{host}/api/call/{call_id}/stream`. Both paths are resolved
//! under the server URL's own path, so a server mounted at `/shop` is reached at
//! `/shop/api/call/start`.

use crate::error::{VoiceError, VoiceResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Server answer to a call start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTicket {
    pub call_id: String,
    #[serde(default)]
    pub status: String,
}

pub struct CallBootstrap {
    client: reqwest::Client,
    base_url: Url,
}

impl CallBootstrap {
    pub fn new(server_url: &str) -> VoiceResult<Self> {
        let mut base_url = Url::parse(server_url)
            .map_err(|e| VoiceError::Config(format!("invalid server_url {:?}: {}", server_url, e)))?;
        // relative joins replace the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .user_agent("carttalk-client")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::Bootstrap(format!("http client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Ask the server to open a new call.
    pub async fn start_call(&self) -> VoiceResult<CallTicket> {
        let url = self.endpoint("api/call/start")?;
        let response = self.client.post(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Bootstrap(format!(
                "call start rejected ({}): {}",
                status, body
            )));
        }

        let ticket: CallTicket = response
            .json()
            .await
            .map_err(|e| VoiceError::Bootstrap(format!("bad call start response: {}", e)))?;
        if ticket.call_id.trim().is_empty() {
            return Err(VoiceError::Bootstrap("server returned an empty call_id".to_string()));
        }
        info!(target: "carttalk::call", call_id = %ticket.call_id, status = %ticket.status, "call started");
        Ok(ticket)
    }

    /// WebSocket URL of the call's stream channel.
    pub fn stream_url(&self, call_id: &str) -> VoiceResult<Url> {
        let scheme = match self.base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(VoiceError::Config(format!(
                    "unsupported server_url scheme {:?}",
                    other
                )))
            }
        };
        let mut url = self.endpoint(&format!("api/call/{}/stream", call_id))?;
        url.set_scheme(scheme)
            .map_err(|_| VoiceError::Config(format!("cannot switch to {}", scheme)))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> VoiceResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| VoiceError::Config(e.to_string()))
    }
}
