//! OpenRouter API client

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{header, Client};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agent::types::{
    ChatCompletionRequest, ChatCompletionResponse, GenerationOptions, Message, ToolChoice,
    ToolDefinition, Usage,
};
use crate::config::OpenRouterConfig;
use crate::error::{Error, Result};

/// One model response plus its accounting
#[derive(Debug, Clone)]
pub struct ModelTurn {
    /// The assistant message, possibly carrying tool calls
    pub message: Message,
    /// Token usage reported by the provider
    pub usage: Usage,
    /// Wall-clock time of the call, retries included
    pub elapsed_ms: u64,
}

/// A provider that can produce one assistant turn
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Complete the transcript, offering the given tools
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &GenerationOptions,
    ) -> Result<ModelTurn>;
}

/// OpenRouter API client
#[derive(Clone)]
pub struct OpenRouterClient {
    /// HTTP client
    client: Client,
    /// Configuration
    config: OpenRouterConfig,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client
    pub fn new(config: OpenRouterConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();

        // Add authorization header
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!(
                "Bearer {}",
                config.api_key.expose_secret()
            ))
            .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
        );

        // Add OpenRouter-specific headers
        if let Some(ref site_url) = config.site_url {
            if let Ok(value) = header::HeaderValue::from_str(site_url) {
                headers.insert("HTTP-Referer", value);
            }
        }
        if let Some(ref site_name) = config.site_name {
            if let Ok(value) = header::HeaderValue::from_str(site_name) {
                headers.insert("X-Title", value);
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(OpenRouterClient { client, config })
    }

    /// Send a request to the OpenRouter API
    async fn send_request(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let url = format!("{}/chat/completions", self.config.base_url);

        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.json::<ChatCompletionResponse>().await?;

            if let Some(ref usage) = body.usage {
                info!(
                    "OpenRouter response: model={}, tokens={}",
                    body.model, usage.total_tokens
                );
            }

            Ok(body)
        } else {
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                warn!("Rate limit exceeded: {}", error_text);
                Err(Error::RateLimit(error_text))
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                Err(Error::Unauthorized("Invalid API key".to_string()))
            } else if status.is_server_error() {
                Err(Error::ServerUnavailable(format!(
                    "OpenRouter unavailable ({}): {}",
                    status, error_text
                )))
            } else {
                Err(Error::ModelCall(format!(
                    "API error ({}): {}",
                    status, error_text
                )))
            }
        }
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    fn model(&self) -> &str {
        &self.config.default_model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &GenerationOptions,
    ) -> Result<ModelTurn> {
        let request = ChatCompletionRequest {
            model: self.config.default_model.clone(),
            messages: messages.to_vec(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            stop: options.stop.clone(),
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.to_vec())
            },
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some(ToolChoice::Auto)
            },
        };

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(None)
            .build();

        let mut response = backoff::future::retry(policy, || async {
            match self.send_request(&request).await {
                Ok(response) => Ok(response),
                Err(e)
                    if e.is_retryable()
                        && attempts.fetch_add(1, Ordering::SeqCst) < self.config.max_retries =>
                {
                    warn!("Model call failed, retrying: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        if response.choices.is_empty() {
            return Err(Error::ModelCall(
                "response contained no choices".to_string(),
            ));
        }
        let choice = response.choices.remove(0);
        let usage = response.usage.unwrap_or_default();

        Ok(ModelTurn {
            message: choice.message,
            usage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
