use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tallybook_core::UNCATEGORIZED;

use crate::config::{LlmSection, MlSection};

/// Subcategory used when the generator has nothing better to offer.
pub const MISC_SUBCATEGORY: &str = "Misc";
const MAX_SUBCATEGORY_CHARS: usize = 40;
const DEFAULT_ML_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlPrediction {
    pub main_category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
    pub confidence: f64,
}

impl MlPrediction {
    pub fn uncategorized() -> Self {
        Self { main_category: UNCATEGORIZED.to_string(), sub_category: None, confidence: 0.0 }
    }
}

/// Main-category scorer consulted when no rule matches.
#[async_trait]
pub trait MlClassifier: Send + Sync {
    async fn predict(&self, description: &str) -> Result<MlPrediction>;
}

/// Tertiary fallback producing a short subcategory label.
#[async_trait]
pub trait SubcategoryGenerator: Send + Sync {
    async fn generate(&self, description: &str, main_category: &str) -> Result<String>;
}

// ── Classifiers ───────────────────────────────────────────────────────────────

/// Used when no model is deployed.
pub struct NoModel;

#[async_trait]
impl MlClassifier for NoModel {
    async fn predict(&self, _description: &str) -> Result<MlPrediction> {
        Ok(MlPrediction::uncategorized())
    }
}

/// Posts `{"description": ...}` to a scoring service that answers with an
/// `MlPrediction`.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build ML client")?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl MlClassifier for HttpClassifier {
    async fn predict(&self, description: &str) -> Result<MlPrediction> {
        #[derive(Serialize)]
        struct Req<'a> {
            description: &'a str,
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&Req { description })
            .send()
            .await
            .context("ml request")?;

        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            bail!("ml scorer error: {status} {txt}");
        }
        let prediction: MlPrediction = resp.json().await.context("parse ml response")?;
        if !(0.0..=1.0).contains(&prediction.confidence) {
            bail!("ml scorer returned confidence {}", prediction.confidence);
        }
        Ok(prediction)
    }
}

/// Returns a preset prediction.
#[cfg(test)]
pub struct FixedClassifier(pub MlPrediction);

#[cfg(test)]
#[async_trait]
impl MlClassifier for FixedClassifier {
    async fn predict(&self, _description: &str) -> Result<MlPrediction> {
        Ok(self.0.clone())
    }
}

// ── Generators ────────────────────────────────────────────────────────────────

/// Always answers with the same label.
pub struct StaticGenerator(pub String);

impl Default for StaticGenerator {
    fn default() -> Self {
        Self(MISC_SUBCATEGORY.to_string())
    }
}

#[async_trait]
impl SubcategoryGenerator for StaticGenerator {
    async fn generate(&self, _description: &str, _main_category: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// OpenAI chat-completions backed generator.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(api_key: impl Into<String>, llm: &LlmSection) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: llm.model.clone(),
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            temperature: llm.temperature,
        }
    }
}

pub fn subcategory_prompt(description: &str, main_category: &str) -> String {
    format!(
        "You assign a short subcategory (2-5 words) for a business bank transaction.\n\n\
         Main category: {main_category}\n\
         Description: {description}\n\n\
         Rules:\n\
         - Be concise, noun-phrase style.\n\
         - Prefer consistent vendor-based labels if obvious.\n\
         - If unclear, return \"Misc\".\n\n\
         Only return the subcategory text, nothing else."
    )
}

/// Trims the model's answer to a usable label; blank answers become "Misc".
pub fn clean_subcategory(raw: &str) -> String {
    let text = raw.trim().trim_matches('"').trim();
    if text.is_empty() {
        return MISC_SUBCATEGORY.to_string();
    }
    text.chars().take(MAX_SUBCATEGORY_CHARS).collect()
}

#[async_trait]
impl SubcategoryGenerator for OpenAiGenerator {
    async fn generate(&self, description: &str, main_category: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg {
            role: String,
            content: String,
        }

        #[derive(Serialize)]
        struct Req {
            model: String,
            messages: Vec<Msg>,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MsgOut,
        }

        #[derive(Deserialize)]
        struct MsgOut {
            content: Option<String>,
        }

        let body = Req {
            model: self.model.clone(),
            messages: vec![Msg {
                role: "user".to_string(),
                content: subcategory_prompt(description, main_category),
            }],
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("openai request")?;

        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            bail!("openai error: {status} {txt}");
        }

        let out: Resp = resp.json().await.context("parse openai response")?;
        let content = out
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(clean_subcategory(&content))
    }
}

pub fn classifier_from_config(ml: &MlSection) -> Result<Box<dyn MlClassifier>> {
    match ml.endpoint.as_deref() {
        Some(endpoint) => {
            let timeout = ml.timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_ML_TIMEOUT);
            Ok(Box::new(HttpClassifier::new(endpoint, timeout)?))
        }
        None => Ok(Box::new(NoModel)),
    }
}

pub fn generator_from_config(llm: &LlmSection) -> Box<dyn SubcategoryGenerator> {
    match llm.api_key.as_deref() {
        Some(key) => Box::new(OpenAiGenerator::new(key, llm)),
        None => Box::new(StaticGenerator::default()),
    }
}
