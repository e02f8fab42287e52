//! Vision-model client and prompt chain.
//!
//! Talks to any OpenAI-compatible vision endpoint via
//! `POST /v1/chat/completions` with a base64 PNG image part. Models wrap
//! their JSON in prose or code fences often enough that extraction tries a
//! few strategies before giving up.

use serde_json::Value;

/// Classifies screenshots. The executor drives one `analyze` call per
/// iteration; implementations must be callable from a blocking thread.
pub trait Vision: Send + Sync {
    fn analyze(&self, screenshot_b64: &str, prompt: &str) -> anyhow::Result<Value>;
}

/// HTTP client for an OpenAI-compatible vision endpoint.
pub struct VisionClient {
    http: reqwest::Client,
    handle: tokio::runtime::Handle,
    base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl VisionClient {
    pub fn new(
        http: reqwest::Client,
        handle: tokio::runtime::Handle,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> Self {
        Self {
            http,
            handle,
            base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 2048,
            temperature: 0.1,
        }
    }

    async fn chat(&self, screenshot_b64: &str, prompt: &str) -> anyhow::Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": prompt},
                {"role": "user", "content": [
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{screenshot_b64}"),
                    }},
                    {"type": "text", "text": "Analyze this screenshot and respond with the JSON action."},
                ]},
            ],
        });

        let res = self
            .http
            .post(format!("{}/v1/chat/completions", self.base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("vision endpoint: http {status}: {body}");
        }
        let body: Value = res.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("vision response has no message content"))?;
        Ok(content.to_string())
    }
}

impl Vision for VisionClient {
    fn analyze(&self, screenshot_b64: &str, prompt: &str) -> anyhow::Result<Value> {
        let raw = self
            .handle
            .block_on(self.chat(screenshot_b64, prompt))?;
        extract_json(&raw)
    }
}

/// Pull the first JSON object out of model output: direct parse, then a
/// ```json fence, then a balanced-brace scan.
pub fn extract_json(raw: &str) -> anyhow::Result<Value> {
    let text = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return Ok(value);
        }
    }

    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
    }

    let mut depth = 0usize;
    let mut start = None;
    for (i, ch) in text.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start {
                        if let Ok(value) = serde_json::from_str::<Value>(&text[s..=i]) {
                            if value.is_object() {
                                return Ok(value);
                            }
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }

    anyhow::bail!("no JSON object in vision output: {:.200}", text)
}

// --- prompt chain ---

const PAGE_TYPES: &str = "user_pass, user_only, pass_only, button_only, profile_select, \
email_code_single, email_code_multi, phone_code_single, phone_code_multi, email_link, \
captcha, spinner, signed_in, unknown";

/// Sign-in phase prompt: classify the page and box the interactive
/// elements.
pub fn signin_prompt(service: &str) -> String {
    format!(
        "You are looking at a screenshot of the {service} website during sign-in. \
Classify the page as one of: {PAGE_TYPES}. \
Respond with JSON only: {{\"page_type\": ..., \"email_box\": [x1,y1,x2,y2] or null, \
\"password_box\": ..., \"button_box\": ..., \"profile_box\": ..., \
\"code_boxes\": [{{\"label\": ..., \"box\": [x1,y1,x2,y2]}}], \
\"actions\": [{{\"action\": \"click\"|\"dismiss\", \"box\": [x1,y1,x2,y2]}}]}}. \
Use `signed_in` once the account is reachable, `spinner` while loading, \
`unknown` with recovery `actions` for cookie banners and interstitials."
    )
}

/// Cancel-flow prompt: one action per screenshot.
pub fn cancel_prompt(service: &str) -> String {
    format!(
        "You are cancelling the {service} subscription of a signed-in account. \
Respond with JSON only: {{\"state\": short page description, \
\"action\": \"click\"|\"type_text\"|\"scroll_up\"|\"scroll_down\"|\"press_key\"|\"wait\"|\"done\"|\"need_human\", \
\"target_description\": ..., \"bounding_box\": [x1,y1,x2,y2] or null, \
\"text_to_type\": semantic hint like 'the password' (never a real secret), \
\"key_to_press\": ..., \"confidence\": 0..1, \"reasoning\": one sentence, \
\"billing_end_date\": ISO date when the confirmation page shows one}}. \
Use `done` only when cancellation is confirmed on screen."
    )
}

/// Resume-flow prompt.
pub fn resume_prompt(service: &str, plan_tier: &str) -> String {
    let plan = if plan_tier.is_empty() {
        "the previous plan".to_string()
    } else {
        format!("the {plan_tier} plan")
    };
    format!(
        "You are resuming a {service} subscription on {plan} for a signed-in account. \
Respond with the same JSON schema as the cancel flow. \
Use `done` only when the subscription is active again."
    )
}
