//! OpenAI-compatible chat client backing the AI tier and rule generation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taxlens_core::{Category, LlmConfig, Rule};
use tracing::{debug, info};

use crate::oracle::{
    AiRequest, AiSuggestion, CategoryOracle, OracleError, RuleGenerator, TrainingSample,
    parse_rules, parse_suggestion,
};

// ── Prompt templates ──

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You classify Nigerian bank transaction narrations for tax bookkeeping.

Given a narration, amount in naira, direction (credit or debit) and optional business \
context, pick exactly one category from this list:
{categories}

Respond ONLY with a JSON object. No markdown fences, no explanation, just raw JSON:
{
  \"category\": \"one category from the list\",
  \"confidence\": a number between 0 and 1,
  \"reasoning\": \"one short sentence\"
}

If the narration gives no real clue, use \"other\" with a low confidence.";

const RULES_SYSTEM_PROMPT: &str = "\
You derive keyword rules from labelled bank transaction narrations.

Each rule maps a short lowercase narration fragment (a merchant or counterparty name, \
not a channel word like POS or TRF) to one category from this list:
{categories}

Respond ONLY with a JSON object. No markdown fences, no explanation, just raw JSON:
{
  \"rules\": [
    {\"pattern\": \"fragment\", \"category\": \"category\", \"confidence\": a number between 0 and 1}
  ]
}

Only propose a rule when the samples clearly support it. An empty list is a valid answer.";

/// Samples sent per rule-generation call.
const MAX_RULE_SAMPLES: usize = 200;

fn category_list() -> String {
    Category::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_classify_prompt(req: &AiRequest) -> String {
    let mut prompt = format!(
        "Narration: {narration}\n\
         Amount: {amount}\n\
         Direction: {direction}",
        narration = req.narration,
        amount = req.amount,
        direction = req.direction,
    );
    if let Some(ctx) = &req.context {
        if let Some(name) = &ctx.name {
            prompt.push_str(&format!("\nBusiness: {name}"));
        }
        if let Some(industry) = &ctx.industry {
            prompt.push_str(&format!("\nIndustry: {industry}"));
        }
        if let Some(typical) = ctx.typical_amount {
            prompt.push_str(&format!("\nTypical transaction: {typical}"));
        }
    }
    prompt
}

fn build_rules_prompt(samples: &[TrainingSample]) -> String {
    let mut prompt = String::from("Labelled samples (narration => category):\n");
    for s in samples.iter().take(MAX_RULE_SAMPLES) {
        prompt.push_str(&format!("{} => {}\n", s.description, s.category));
    }
    prompt
}

// ── Wire types ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn first_content(resp: ChatResponse) -> Result<String, OracleError> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| OracleError::Malformed("response has no message content".into()))
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatClient {
    /// Build a client from config. Fails with [`OracleError::NotConfigured`]
    /// when no endpoint is set.
    pub fn new(config: &LlmConfig) -> Result<Self, OracleError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(OracleError::NotConfigured)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(url = %url, model = %self.model, "calling chat completions");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = resp.json().await?;
        first_content(parsed)
    }
}

#[async_trait]
impl CategoryOracle for ChatClient {
    async fn suggest(&self, request: &AiRequest) -> Result<AiSuggestion, OracleError> {
        let system = CLASSIFY_SYSTEM_PROMPT.replace("{categories}", &category_list());
        let text = self.complete(&system, &build_classify_prompt(request)).await?;
        parse_suggestion(&text)
    }
}

#[async_trait]
impl RuleGenerator for ChatClient {
    async fn generate_rules(&self, samples: &[TrainingSample]) -> Result<Vec<Rule>, OracleError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let system = RULES_SYSTEM_PROMPT.replace("{categories}", &category_list());
        let text = self.complete(&system, &build_rules_prompt(samples)).await?;
        let rules = parse_rules(&text)?;
        info!(samples = samples.len(), rules = rules.len(), "generated advisory rules");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxlens_core::{Amount, BusinessContext, Direction};

    fn config(base_url: Option<&str>) -> LlmConfig {
        LlmConfig {
            base_url: base_url.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn unconfigured_endpoint_is_rejected() {
        assert!(matches!(
            ChatClient::new(&config(None)),
            Err(OracleError::NotConfigured)
        ));
        assert!(matches!(
            ChatClient::new(&config(Some("  "))),
            Err(OracleError::NotConfigured)
        ));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = ChatClient::new(&config(Some("http://localhost:11434/v1/"))).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434/v1");
        assert_eq!(client.model, "gpt-4o-mini");
    }

    #[test]
    fn classify_prompt_includes_context() {
        let req = AiRequest {
            narration: "NIP TRF TO ADEBAYO STORES".into(),
            amount: Amount::from_major(250_000),
            direction: Direction::Debit,
            context: Some(BusinessContext {
                name: Some("Mama Put Kitchen".into()),
                industry: Some("restaurant".into()),
                typical_amount: Some(Amount::from_major(20_000)),
            }),
        };
        let prompt = build_classify_prompt(&req);
        assert!(prompt.contains("Narration: NIP TRF TO ADEBAYO STORES"));
        assert!(prompt.contains("Amount: 250000.00"));
        assert!(prompt.contains("Direction: debit"));
        assert!(prompt.contains("Industry: restaurant"));
        assert!(prompt.contains("Typical transaction: 20000.00"));
    }

    #[test]
    fn system_prompt_lists_every_category() {
        let system = CLASSIFY_SYSTEM_PROMPT.replace("{categories}", &category_list());
        for c in Category::ALL {
            assert!(system.contains(c.as_str()), "missing {c}");
        }
        assert!(!system.contains("{categories}"));
    }

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn response_content_is_extracted() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant",
                "content": "{\"category\": \"food\", \"confidence\": 0.8}"}}]}"#,
        )
        .unwrap();
        let text = first_content(resp).unwrap();
        assert_eq!(parse_suggestion(&text).unwrap().category, Category::Food);
    }

    #[test]
    fn empty_choices_are_malformed() {
        let resp: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(first_content(resp), Err(OracleError::Malformed(_))));
    }

    #[test]
    fn rules_prompt_is_capped() {
        let samples: Vec<TrainingSample> = (0..300)
            .map(|i| TrainingSample {
                description: format!("VENDOR {i}"),
                category: Category::Supplies,
            })
            .collect();
        let prompt = build_rules_prompt(&samples);
        assert_eq!(prompt.lines().count(), 1 + MAX_RULE_SAMPLES);
    }
}
