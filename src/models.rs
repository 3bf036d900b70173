use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendError;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    pub generation: GenerationParams,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl GenerateRequest {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            request_id: format!("req_{}", Uuid::new_v4()),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: prompt.into(),
            }],
            generation: GenerationParams::default(),
        }
    }

    pub fn last_user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }
}

impl ChatCompletionsRequest {
    pub fn into_generate(self) -> Result<GenerateRequest, String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_owned());
        }

        Ok(GenerateRequest {
            request_id: format!("req_{}", Uuid::new_v4()),
            messages: self.messages,
            generation: GenerationParams {
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    Start,
    TextDelta { text: String },
    Finish { reason: String, usage: Usage },
    Error { error: BackendError },
}

impl StreamPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn is_output(&self) -> bool {
        !matches!(self, Self::Start)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Delta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Delta {
    pub fn role() -> Self {
        Self {
            role: Some("assistant"),
            content: None,
        }
    }

    pub fn text(text: String) -> Self {
        Self {
            role: None,
            content: Some(text),
        }
    }
}

impl ChatCompletionsResponse {
    pub fn completion(id: String, created: i64, model: String, response: GenerateResponse) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: Some(Delta {
                    content: Some(response.content),
                    ..Delta::role()
                }),
                delta: None,
                finish_reason: Some(response.finish_reason),
            }],
            usage: Some(response.usage),
        }
    }

    pub fn chunk(
        id: &str,
        created: i64,
        model: &str,
        delta: Delta,
        finish: Option<String>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk",
            created,
            model: model.to_owned(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason: finish,
            }],
            usage: None,
        }
    }
}
