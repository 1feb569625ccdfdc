//! Datto RMM REST client.
//!
//! Authenticates with the OAuth password grant using the API key pair, then
//! sends the access token as a bearer token. The token is cached for the
//! client's lifetime; a 401 triggers one re-authentication.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::{Device, MonitoringSource, RmmConfig, Site, SiteVariable};
use crate::remote::client::decode_json;
use crate::remote::{Page, PageCursor, RemoteClient, RemoteError};

/// Basic credentials of Datto's public OAuth client (`public-client:public`).
const PUBLIC_CLIENT_AUTH: &str = "Basic cHVibGljLWNsaWVudDpwdWJsaWM=";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageDetails {
    #[serde(default)]
    next_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SitesResponse {
    #[serde(default)]
    sites: Vec<Site>,
    #[serde(default)]
    page_details: Option<PageDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    page_details: Option<PageDetails>,
}

#[derive(Debug, Deserialize)]
struct VariablesResponse {
    #[serde(default)]
    variables: Vec<SiteVariable>,
}

pub struct DattoClient {
    remote: RemoteClient,
    api_endpoint: String,
    public_key: String,
    secret_key: String,
    token: Mutex<Option<String>>,
}

impl DattoClient {
    pub fn new(config: &RmmConfig) -> Result<Self, RemoteError> {
        if config.public_key.trim().is_empty() || config.secret_key.trim().is_empty() {
            return Err(RemoteError::Auth("Datto API key pair is not configured".to_string()));
        }
        let remote = RemoteClient::new("datto", config.requests_per_second, config.retry.clone())?;
        Ok(Self {
            remote,
            api_endpoint: config.api_endpoint.trim().trim_end_matches('/').to_string(),
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
            token: Mutex::new(None),
        })
    }

    async fn authenticate(&self) -> Result<String, RemoteError> {
        let request = self
            .remote
            .http()
            .post(format!("{}/auth/oauth/token", self.api_endpoint))
            .header(AUTHORIZATION, PUBLIC_CLIENT_AUTH)
            .form(&[
                ("grant_type", "password"),
                ("username", self.public_key.as_str()),
                ("password", self.secret_key.as_str()),
            ]);
        let response = match self.remote.send(request).await {
            Ok(response) => response,
            Err(RemoteError::Api { status, message }) if status == 400 || status == 401 => {
                return Err(RemoteError::Auth(format!("token request rejected ({}): {}", status, message)));
            }
            Err(e) => return Err(e),
        };
        let token: TokenResponse = decode_json(response).await?;
        log::info!("Datto: authenticated");
        Ok(token.access_token)
    }

    async fn bearer(&self) -> Result<String, RemoteError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.authenticate().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self, stale: &str) {
        let mut cached = self.token.lock().await;
        if cached.as_deref() == Some(stale) {
            *cached = None;
        }
    }

    /// Send an authenticated request built by `build`, re-authenticating once on 401.
    async fn send_authed<F>(&self, build: F) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = self.bearer().await?;
        let first = build(self.remote.http()).header(AUTHORIZATION, format!("Bearer {}", token));
        match self.remote.send(first).await {
            Err(e) if e.status() == Some(401) => {
                log::warn!("Datto: access token rejected, re-authenticating");
                self.invalidate(&token).await;
                let token = self.bearer().await?;
                let retry =
                    build(self.remote.http()).header(AUTHORIZATION, format!("Bearer {}", token));
                self.remote.send(retry).await
            }
            other => other,
        }
    }

    fn page_url(&self, cursor: &PageCursor, first: &str) -> String {
        match cursor {
            PageCursor::Url(url) => url.clone(),
            _ => format!("{}{}", self.api_endpoint, first),
        }
    }
}

#[async_trait]
impl MonitoringSource for DattoClient {
    async fn sites_page(&self, cursor: PageCursor) -> Result<Page<Site>, RemoteError> {
        let url = self.page_url(&cursor, "/api/v2/account/sites");
        let response = self.send_authed(|http| http.get(&url)).await?;
        let body: SitesResponse = decode_json(response).await?;
        let next = body.page_details.and_then(|p| p.next_page_url);
        Ok(Page::linked(body.sites, next))
    }

    async fn site_variables(&self, site_uid: &str) -> Result<Vec<SiteVariable>, RemoteError> {
        let url = format!("{}/api/v2/site/{}/variables", self.api_endpoint, site_uid);
        let response = self.send_authed(|http| http.get(&url)).await?;
        let body: VariablesResponse = decode_json(response).await?;
        Ok(body.variables)
    }

    async fn set_site_variable(&self, site_uid: &str, name: &str, value: &str) -> Result<(), RemoteError> {
        let url = format!("{}/api/v2/site/{}/variable", self.api_endpoint, site_uid);
        let payload = json!({ "name": name, "value": value });
        self.send_authed(|http| http.put(&url).json(&payload)).await?;
        Ok(())
    }

    async fn devices_page(&self, cursor: PageCursor) -> Result<Page<Device>, RemoteError> {
        let url = self.page_url(&cursor, "/api/v2/account/devices");
        let response = self.send_authed(|http| http.get(&url)).await?;
        let body: DevicesResponse = decode_json(response).await?;
        let next = body.page_details.and_then(|p| p.next_page_url);
        Ok(Page::linked(body.devices, next))
    }
}
