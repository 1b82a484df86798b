//! OAuth authorization for MCP servers.
//!
//! The manager only depends on the [`McpAuthProvider`] trait; the bundled
//! [`PkceAuthProvider`] implements the authorization-code flow with PKCE
//! (S256) against a server's authorize/token endpoints.
//!
//! The OAuth `state` parameter carries the OAuth client id, and the
//! callback handler writes the received `state` back into the provider as
//! its client id. That is the wire contract of the callback demultiplexer
//! (see `handle_callback_request`), kept as-is rather than a CSRF token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{McpError, McpResult};

/// Supplies bearer tokens and runs the authorization flow for one server
/// connection.
#[async_trait]
pub trait McpAuthProvider: Send + Sync {
    /// The registered redirect URL, suffixed with the server id once one
    /// is assigned.
    fn redirect_url(&self) -> Option<String>;

    fn client_id(&self) -> Option<String>;
    fn set_client_id(&self, id: String);

    fn server_id(&self) -> Option<String>;
    fn set_server_id(&self, id: String);

    /// Begin the authorization flow; returns the URL the user must visit.
    async fn begin_auth(&self, server_url: &str) -> McpResult<String>;

    /// Exchange the authorization code for tokens.
    async fn finish_auth(&self, code: &str) -> McpResult<()>;

    /// The current access token, if authorized.
    async fn bearer_token(&self) -> Option<String>;
}

/// URL-safe base64, no padding.
fn base64_url_encode(data: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, data)
}

/// A PKCE code_verifier / code_challenge (S256) pair.
struct PkcePair {
    verifier: String,
    challenge: String,
}

fn generate_pkce() -> PkcePair {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let verifier = base64_url_encode(&bytes);
    let challenge = {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        base64_url_encode(&hasher.finalize())
    };
    PkcePair {
        verifier,
        challenge,
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Default)]
struct PkceState {
    client_id: Option<String>,
    server_id: Option<String>,
    verifier: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Authorization-code + PKCE provider for one server connection.
pub struct PkceAuthProvider {
    authorize_url: String,
    token_url: String,
    /// Base redirect URL; the server id is appended as the trailing path
    /// segment so the callback demultiplexer can route it back.
    redirect_base: String,
    scopes: Vec<String>,
    client: reqwest::Client,
    state: Mutex<PkceState>,
}

impl PkceAuthProvider {
    pub fn new(
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        redirect_base: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("warren-mcp/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            redirect_base: redirect_base.into().trim_end_matches('/').to_string(),
            scopes: Vec::new(),
            client,
            state: Mutex::new(PkceState::default()),
        }
    }

    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        self.set_client_id(client_id.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    fn locked<T>(&self, f: impl FnOnce(&mut PkceState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl McpAuthProvider for PkceAuthProvider {
    fn redirect_url(&self) -> Option<String> {
        let server_id = self.locked(|s| s.server_id.clone())?;
        Some(format!("{}/{}", self.redirect_base, server_id))
    }

    fn client_id(&self) -> Option<String> {
        self.locked(|s| s.client_id.clone())
    }

    fn set_client_id(&self, id: String) {
        self.locked(|s| s.client_id = Some(id));
    }

    fn server_id(&self) -> Option<String> {
        self.locked(|s| s.server_id.clone())
    }

    fn set_server_id(&self, id: String) {
        self.locked(|s| s.server_id = Some(id));
    }

    async fn begin_auth(&self, server_url: &str) -> McpResult<String> {
        let pkce = generate_pkce();
        let client_id = self.client_id().ok_or_else(|| McpError::OAuth {
            reason: "no OAuth client id configured".to_string(),
        })?;
        let redirect = self.redirect_url().ok_or_else(|| McpError::OAuth {
            reason: "no server id assigned yet".to_string(),
        })?;
        self.locked(|s| s.verifier = Some(pkce.verifier.clone()));

        debug!(server = %server_url, "starting PKCE authorization");
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.authorize_url,
            percent_encode(&client_id),
            percent_encode(&redirect),
            // The state parameter carries the client id (see module docs).
            percent_encode(&client_id),
            percent_encode(&pkce.challenge),
        );
        if !self.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&percent_encode(&self.scopes.join(" ")));
        }
        Ok(url)
    }

    async fn finish_auth(&self, code: &str) -> McpResult<()> {
        let (client_id, redirect, verifier) = self.locked(|s| {
            (
                s.client_id.clone(),
                s.server_id.clone().map(|id| format!("{}/{}", self.redirect_base, id)),
                s.verifier.clone(),
            )
        });
        let client_id = client_id.ok_or_else(|| McpError::OAuth {
            reason: "no OAuth client id configured".to_string(),
        })?;
        let redirect = redirect.ok_or_else(|| McpError::OAuth {
            reason: "no server id assigned yet".to_string(),
        })?;
        let verifier = verifier.ok_or_else(|| McpError::OAuth {
            reason: "token exchange attempted before authorization began".to_string(),
        })?;

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", redirect);
        form.insert("client_id", client_id);
        form.insert("code_verifier", verifier);

        let response = self.client.post(&self.token_url).form(&form).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::OAuth {
                reason: format!("token exchange failed ({status}): {body}"),
            });
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
        }
        let tokens: TokenResponse = response.json().await?;
        self.locked(|s| {
            s.access_token = Some(tokens.access_token);
            s.refresh_token = tokens.refresh_token;
        });
        debug!("PKCE token exchange complete");
        Ok(())
    }

    async fn bearer_token(&self) -> Option<String> {
        self.locked(|s| s.access_token.clone())
    }
}
