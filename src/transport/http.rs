//! reqwest-backed transport

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, warn};

use super::jsonlines::decode_json_lines;
use super::request::{FileUpload, OutboundRequest, RequestBody, REFERER_HEADER};
use super::{ResponseStream, Transport};
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::tree::ResponseItem;

/// HTTP transport: POSTs each interaction and decodes the response.
///
/// Cookies persist across requests so server sessions survive the way they
/// would in a browser.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .user_agent(config.user_agent.clone());
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    /// Use a preconfigured client (proxies, custom TLS, shared pools).
    pub fn with_client(client: Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ResponseStream, TransportError> {
        let OutboundRequest {
            url,
            body,
            referer,
            files,
            ..
        } = request;

        let mut builder = self.client.post(url.clone());
        if let Some(referer) = referer {
            builder = builder.header(REFERER_HEADER, referer);
        }
        builder = if files.is_empty() {
            builder.json(&body)
        } else {
            builder.multipart(multipart_form(&body, files)?)
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), url = %url, "interaction rejected");
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if self.config.is_stream_content_type(&content_type) {
            debug!(url = %url, content_type = %content_type, "streaming response");
            Ok(decode_json_lines(response.bytes_stream()))
        } else {
            let item: ResponseItem = response.json().await?;
            Ok(futures::stream::iter([Ok(item)]).boxed())
        }
    }
}

/// `json` part with the serialized body plus one `files` part per upload.
fn multipart_form(body: &RequestBody, files: Vec<FileUpload>) -> Result<Form, TransportError> {
    let json = serde_json::to_string(body).map_err(|e| TransportError::Request(e.to_string()))?;
    let mut form = Form::new().text("json", json);
    for file in files {
        let mut part = Part::bytes(file.bytes).file_name(file.file_name);
        if let Some(content_type) = file.content_type {
            part = part.mime_str(&content_type)?;
        }
        form = form.part("files", part);
    }
    Ok(form)
}
