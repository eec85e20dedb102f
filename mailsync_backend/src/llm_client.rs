use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::TextGenerator;
use crate::error::ServiceError;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful email summarization assistant. Be concise and actionable.";

const REPLY_SYSTEM_PROMPT: &str = "You are a professional email writing assistant. \
     Generate polite, concise replies that are helpful and actionable.";

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String, client: reqwest::Client) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        }
    }

    /// Generate a completion using the OpenAI API format
    pub async fn generate(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ServiceError::from_transport("LLM request", &e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(classify_llm_status(status, &body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Permanent(format!("Failed to parse LLM response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ServiceError::Permanent("No response from LLM".to_string()))
    }
}

/// A rejected API key is an operator problem: fail the call, never touch the
/// mailbox subscription.
fn classify_llm_status(status: reqwest::StatusCode, body: &str) -> ServiceError {
    match status.as_u16() {
        401 | 403 => ServiceError::Permanent(format!("LLM API returned {}: {}", status, body)),
        _ => ServiceError::from_status("LLM API", status, body),
    }
}

fn summary_prompt(subject: &str, body: &str, from: &str) -> String {
    format!(
        "You are an AI assistant that summarizes emails concisely for busy professionals.\n\n\
         Email Details:\nFrom: {}\nSubject: {}\n\nBody:\n{}\n\n\
         Instructions:\n\
         1. Provide a 2-3 sentence summary\n\
         2. Highlight any action items or deadlines\n\
         3. Use emojis to make it visually appealing\n\
         4. Keep it under 150 words\n\n\
         Format your response as a Telegram message.",
        from, subject, body
    )
}

fn reply_prompt(subject: &str, body: &str, from: &str) -> String {
    format!(
        "You are an AI assistant that helps write professional email replies.\n\n\
         Original Email:\nFrom: {}\nSubject: {}\n\nBody:\n{}\n\n\
         Instructions:\n\
         1. Generate a polite, professional reply\n\
         2. Address the main points from the original email\n\
         3. Keep it concise and clear (under 200 words)\n\
         4. Use a friendly but professional tone\n\
         5. End with an appropriate sign-off\n\n\
         Generate the reply text only (no \"Subject:\" or \"To:\" fields):",
        from, subject, body
    )
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn summarize(
        &self,
        subject: &str,
        body: &str,
        from: &str,
    ) -> Result<String, ServiceError> {
        let messages = vec![
            Message::system(SUMMARY_SYSTEM_PROMPT),
            Message::user(summary_prompt(subject, body, from)),
        ];
        self.generate(messages, 0.7, 300).await
    }

    async fn draft_reply(
        &self,
        subject: &str,
        body: &str,
        from: &str,
    ) -> Result<String, ServiceError> {
        let messages = vec![
            Message::system(REPLY_SYSTEM_PROMPT),
            Message::user(reply_prompt(subject, body, from)),
        ];
        self.generate(messages, 0.8, 500).await
    }
}
