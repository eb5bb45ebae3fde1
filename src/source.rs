use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::CtlConfig;
use crate::error::{CtlError, Result};

const DOWNLOAD_URL_DISCOVERY: &str =
    "https://clients5.google.com/cxx-compiler-service/downloadurl";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where packages and their manifests come from.
#[async_trait]
pub trait PackageSource: Send + Sync {
    async fn base_url(&self) -> Result<String>;

    /// Downloads `<base_url>/<name>`.
    async fn fetch(&self, name: &str) -> Result<Vec<u8>>;

    async fn fetch_to(&self, name: &str, dest: &Path) -> Result<()> {
        let bytes = self.fetch(name).await?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

/// Validates the discovery response and applies channel and scheme rules.
pub fn normalize_base_url(response: &str, channel: Option<&str>) -> Result<String> {
    let response = response.trim();
    if !response.starts_with("http") {
        return Err(CtlError::Network(format!(
            "Could not obtain the download base URL.\nServer response: {}",
            response
        )));
    }
    let mut url = response.to_string();
    if let Some(channel) = channel {
        url.push('/');
        url.push_str(channel);
    }
    if let Some(rest) = url.strip_prefix("http:") {
        url = format!("https:{}", rest);
    }
    Ok(url)
}

pub struct HttpSource {
    client: reqwest::Client,
    discovery_url: String,
    channel: Option<String>,
    retries: u32,
    base_url: OnceCell<String>,
}

impl HttpSource {
    pub fn new(config: &CtlConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent("goma-ctl");
        if let Some(proxy) = config.flags.proxy_address() {
            tracing::debug!(proxy = %proxy, "Downloading through proxy");
            builder = builder.proxy(reqwest::Proxy::all(format!("http://{}", proxy))?);
        }
        let client = builder
            .build()
            .map_err(|e| CtlError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = match &config.package_base_url {
            Some(url) => OnceCell::new_with(Some(url.trim_end_matches('/').to_string())),
            None => OnceCell::new(),
        };
        Ok(Self {
            client,
            discovery_url: DOWNLOAD_URL_DISCOVERY.to_string(),
            channel: config.channel.clone(),
            retries: config.timing.download_retries,
            base_url,
        })
    }

    /// GET with a fixed retry budget for transport errors and 5xx replies.
    /// Other statuses are returned as-is; callers validate the body.
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            let result = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    Err(CtlError::Network(format!("{} returned {}", url, resp.status())))
                }
                Ok(resp) => resp.bytes().await.map(|b| b.to_vec()).map_err(CtlError::from),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(url, attempt, error = %e, "Download failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(CtlError::Network(format!("failed to fetch {}: {}", url, e)))
                }
            }
        }
    }
}

#[async_trait]
impl PackageSource for HttpSource {
    async fn base_url(&self) -> Result<String> {
        let url = self
            .base_url
            .get_or_try_init(|| async {
                let body = self.get(&self.discovery_url).await?;
                normalize_base_url(&String::from_utf8_lossy(&body), self.channel.as_deref())
            })
            .await?;
        Ok(url.clone())
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url().await?, name);
        self.get(&url).await
    }
}
