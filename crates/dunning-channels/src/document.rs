//! Billing-portal document fetcher.
//!
//! `GET {portal_url}/customers/{customer_id}/invoice[?protocol=..]` returns
//! the PDF; 404 means no open invoice. Files land in `download_dir` as
//! `{customer_id}[-{protocol}].pdf`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dunning_core::config::{DocumentsConfig, expand_path};
use dunning_core::error::{DunningError, Result};
use dunning_core::traits::DocumentFetcher;

pub struct PortalDocumentFetcher {
    portal_url: String,
    api_token: String,
    download_dir: PathBuf,
    client: reqwest::Client,
}

impl PortalDocumentFetcher {
    pub fn new(config: &DocumentsConfig) -> Self {
        Self {
            portal_url: config.portal_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            download_dir: expand_path(&config.download_dir),
            client: reqwest::Client::new(),
        }
    }

    /// Invoice endpoint for `customer_id`, which is encoded as a single path
    /// segment.
    fn invoice_url(&self, customer_id: &str) -> Result<reqwest::Url> {
        if customer_id.is_empty() || customer_id == "." || customer_id == ".." {
            return Err(DunningError::Document(format!(
                "invalid customer id '{customer_id}'"
            )));
        }
        let mut url = reqwest::Url::parse(&self.portal_url)
            .map_err(|e| DunningError::Config(format!("invalid portal_url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| DunningError::Config("portal_url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["customers", customer_id, "invoice"]);
        Ok(url)
    }
}

#[async_trait]
impl DocumentFetcher for PortalDocumentFetcher {
    fn name(&self) -> &str {
        "portal"
    }

    async fn fetch(
        &self,
        customer_id: &str,
        protocol: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<PathBuf>> {
        let mut request = self.client.get(self.invoice_url(customer_id)?).timeout(timeout);
        if let Some(p) = protocol {
            request = request.query(&[("protocol", p)]);
        }
        if !self.api_token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_token));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DunningError::Timeout(timeout.as_secs())
            } else {
                DunningError::Document(format!("portal request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("📄 No invoice on the portal for customer {}", customer_id);
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DunningError::Document(format!(
                "portal returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DunningError::Document(format!("portal body: {e}")))?;
        if !looks_like_pdf(&bytes) {
            return Err(DunningError::Document("portal response is not a PDF".into()));
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(document_file_name(customer_id, protocol));
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!("📄 Invoice saved: {} ({} bytes)", path.display(), bytes.len());
        Ok(Some(path))
    }
}

fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// File name for a downloaded invoice, safe for any filesystem.
fn document_file_name(customer_id: &str, protocol: Option<&str>) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    };
    match protocol {
        Some(p) => format!("{}-{}.pdf", clean(customer_id), clean(p)),
        None => format!("{}.pdf", clean(customer_id)),
    }
}
