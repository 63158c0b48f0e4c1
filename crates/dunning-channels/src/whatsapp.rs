//! WhatsApp Business Cloud API transport.
//!
//! Uses the official WhatsApp Business Platform (Cloud API) for messaging.
//! Requires: Access Token + Phone Number ID from Meta Business Suite.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dunning_core::config::WhatsAppConfig;
use dunning_core::error::{DunningError, Result};
use dunning_core::traits::Transport;
use dunning_core::types::{OutgoingMessage, mask_id};

/// Graph error codes meaning the number cannot receive WhatsApp messages.
const INVALID_RECIPIENT_CODES: &[i64] = &[
    131026, // message undeliverable (not on WhatsApp)
    131009, // parameter value is not valid (to)
    131021, // recipient cannot be sender
];

/// Graph error codes that are throttling, not refusals.
const THROTTLE_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

/// WhatsApp Business transport implementation.
pub struct WhatsAppTransport {
    config: WhatsAppConfig,
    client: reqwest::Client,
    /// Flipped off by `send` when the token stops being accepted.
    connected: AtomicBool,
}

impl WhatsAppTransport {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            connected: AtomicBool::new(false),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.config.api_base, self.config.phone_number_id)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.config.access_token)
    }

    /// Send a text message via WhatsApp Cloud API.
    async fn send_text_message(&self, to: &str, text: &str) -> Result<String> {
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text
            }
        });
        self.post_message(to, &body).await
    }

    /// Send an uploaded document with the message text as caption.
    async fn send_document_message(&self, to: &str, media_id: &str, filename: &str, caption: &str) -> Result<String> {
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "document",
            "document": {
                "id": media_id,
                "filename": filename,
                "caption": caption
            }
        });
        self.post_message(to, &body).await
    }

    async fn post_message(&self, to: &str, body: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(self.messages_url())
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            let err = classify_api_error(status, &error_text);
            if matches!(err, DunningError::Disconnected(_)) {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(err);
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DunningError::Channel(format!("Invalid WhatsApp response: {e}")))?;

        let msg_id = result["messages"][0]["id"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        tracing::debug!("WhatsApp message sent: {} → {}", msg_id, mask_id(to));
        Ok(msg_id)
    }

    /// Upload a PDF to the media endpoint. Returns the media id.
    async fn upload_media(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let filename = file_name(path);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/pdf")
            .map_err(|e| DunningError::Channel(format!("WhatsApp media part: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", "application/pdf")
            .part("file", part);

        let url = format!("{}/{}/media", self.config.api_base, self.config.phone_number_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            // An upload failure says nothing about the recipient.
            return Err(match classify_api_error(status, &error_text) {
                DunningError::InvalidRecipient(m) | DunningError::Rejected(m) => {
                    DunningError::Channel(format!("media upload refused: {m}"))
                }
                other => other,
            });
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DunningError::Channel(format!("Invalid WhatsApp media response: {e}")))?;
        result["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| DunningError::Channel("WhatsApp media response without id".into()))
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.config.access_token.is_empty() {
            return Err(DunningError::Config("WhatsApp access_token not configured".into()));
        }
        if self.config.phone_number_id.is_empty() {
            return Err(DunningError::Config("WhatsApp phone_number_id not configured".into()));
        }

        // Verify token by checking phone number
        let url = format!("{}/{}", self.config.api_base, self.config.phone_number_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(request_error)?;

        if response.status().is_success() {
            self.connected.store(true, Ordering::SeqCst);
            tracing::info!("WhatsApp Business: connected (phone_id={})", self.config.phone_number_id);
            Ok(())
        } else {
            self.connected.store(false, Ordering::SeqCst);
            let text = response.text().await.unwrap_or_default();
            Err(DunningError::Disconnected(format!(
                "WhatsApp token verification failed: {}",
                text
            )))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("WhatsApp Business: disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        match &message.attachment {
            Some(path) => {
                let media_id = self.upload_media(path).await?;
                self.send_document_message(&message.recipient_id, &media_id, &file_name(path), &message.content)
                    .await?;
            }
            None => {
                self.send_text_message(&message.recipient_id, &message.content).await?;
            }
        }
        Ok(())
    }

    // No composing indicator on the Cloud API; the default no-op applies.
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".into())
}

fn request_error(e: reqwest::Error) -> DunningError {
    if e.is_timeout() {
        DunningError::Channel(format!("WhatsApp API request timed out: {e}"))
    } else if e.is_connect() {
        DunningError::Disconnected(format!("WhatsApp API unreachable: {e}"))
    } else {
        DunningError::Channel(format!("WhatsApp API request failed: {e}"))
    }
}

/// Map a Graph API error response onto the dispatch error taxonomy.
pub fn classify_api_error(status: u16, body: &str) -> DunningError {
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let code = parsed["error"]["code"].as_i64();
    let message = parsed["error"]["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let detail = format!("WhatsApp API error {status}: {message}");

    if code.is_some_and(|c| INVALID_RECIPIENT_CODES.contains(&c)) {
        return DunningError::InvalidRecipient(detail);
    }
    if code.is_some_and(|c| THROTTLE_CODES.contains(&c)) || status == 429 {
        return DunningError::Channel(detail);
    }
    // 190: access token expired or revoked.
    if status == 401 || code == Some(190) {
        return DunningError::Disconnected(detail);
    }
    match status {
        400..=499 => DunningError::Rejected(detail),
        _ => DunningError::Channel(detail),
    }
}
