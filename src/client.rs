use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::error::TaskError;
use crate::types::{ImageRef, Indicator};

/// The external vision classifier. Returns the model's raw text answer.
#[async_trait]
pub trait ClassifierClient: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<String>;
}

/// Turns a task's image reference into bytes.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, image: &ImageRef) -> Result<Vec<u8>, TaskError>;
}

/// Reads images from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FsImageLoader;

#[async_trait]
impl ImageLoader for FsImageLoader {
    async fn load(&self, image: &ImageRef) -> Result<Vec<u8>, TaskError> {
        match image {
            ImageRef::Unresolved => Err(TaskError::ImageUnresolved),
            ImageRef::Path(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| TaskError::ImageRead {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

const SYSTEM_PROMPT: &str = "You are an expert in Traditional Chinese Medicine (TCM) specializing in tongue diagnosis. \
Your task is to analyze the provided tongue image and classify specific features according to the predefined English labels. \
You MUST adhere strictly to the provided label options and output format. Output ONLY the JSON object.";

fn instruction_prompt() -> String {
    let descriptions = [
        (Indicator::CoatingLabel, "Tongue coating characteristic"),
        (Indicator::TaiLabel, "Color of tongue coating"),
        (Indicator::ZhiLabel, "Color of tongue body"),
        (Indicator::FissureLabel, "Cracks on tongue"),
        (Indicator::ToothMkLabel, "Tooth marks on tongue sides"),
    ];

    let mut prompt = String::from(
        "Analyze the tongue image provided and classify the following five indicators. \
For each indicator, select ONLY ONE label from the exact options provided below.\n\n",
    );
    for (number, (indicator, description)) in descriptions.iter().enumerate() {
        let options = indicator
            .label_options()
            .iter()
            .map(|option| format!("`{option}`"))
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!(
            "{}. **{}** ({description}):\n    Options: [{options}]\n",
            number + 1,
            indicator.key()
        ));
        if matches!(indicator, Indicator::FissureLabel | Indicator::ToothMkLabel) {
            prompt.push_str("    (Use `NaN` if the feature is not visible.)\n");
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Your entire response must be ONLY a single JSON object containing these five keys and their \
corresponding selected labels. Do not include any introductory text, explanations, or markdown \
formatting outside the JSON structure.\n\nExample Format:\n```json\n\
{\"coating_label\": \"greasy\", \"tai_label\": \"white\", \"zhi_label\": \"regular\", \
\"fissure_label\": \"NaN\", \"tooth_mk_label\": \"light\"}\n```",
    );
    prompt
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` vision endpoint.
pub struct ChatCompletionsClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    prompt: String,
}

impl ChatCompletionsClient {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            model: config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            prompt: instruction_prompt(),
        })
    }

    fn request_body(&self, image: &[u8]) -> ChatRequest<'_> {
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(image));
        ChatRequest {
            model: &self.model,
            messages: vec![
                json!({ "role": "system", "content": SYSTEM_PROMPT }),
                json!({
                    "role": "user",
                    "content": [
                        { "type": "text", "text": self.prompt },
                        { "type": "image_url", "image_url": { "url": data_url } },
                    ],
                }),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl ClassifierClient for ChatCompletionsClient {
    #[tracing::instrument(skip(self, image), fields(model = %self.model, image_bytes = image.len()))]
    async fn classify(&self, image: &[u8]) -> Result<String> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(image))
            .send()
            .await
            .context("Request to vision endpoint failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Vision endpoint returned {status}: {body}");
        }

        let body: ChatResponse = response
            .json()
            .await
            .context("Failed to decode vision endpoint response")?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}
