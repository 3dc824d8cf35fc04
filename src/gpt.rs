//! Boundary to the OpenAI-compatible model backend.
//!
//! Three calls: strict-JSON command parsing of free text, a vision estimate
//! for meal photos, and a plain chat fallback. Every call has a bounded
//! retry for transport errors; command parsing additionally runs under a
//! hard timeout so a slow backend never wedges a chat.

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Hard budget for the command parser; slower replies are treated as absent.
pub const PARSE_TIMEOUT_SECS: u64 = 10;

const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_JITTER_MS: u64 = 250;

/// Instructions for the command parser. The model must answer with exactly
/// one JSON object and nothing else.
const SYSTEM_PROMPT: &str = "\
Ты — парсер команд дневника диабета. Пользователь пишет свободным текстом \
по-русски. Ответь СТРОГО одним JSON-объектом без пояснений, без markdown и \
без текста вокруг.

Формат: {\"action\": \"...\", ...поля}

Допустимые action:
- \"add_entry\": новая запись. Поля: sugar_before (ммоль/л), xe (ХЕ), \
carbs_g (граммы углеводов), dose (единицы инсулина), time (\"HH:MM\"), \
entry_date (\"YYYY-MM-DD\"). Указывай только то, что явно названо.
- \"update_entry\": правка записи. Поля: entry_id и любые поля записи.
- \"delete_entry\": удаление. Поле: entry_id.
- \"update_profile\": поля icr, cf, target_bg (только названные).
- \"set_reminder\": поле kind из {\"sugar\", \"long_insulin\", \"medicine\", \
\"xe_after\"}, и time (\"HH:MM\") или interval_hours или minutes_after.
- \"get_stats\": статистика. Поле days (число дней, по умолчанию 7).
- \"get_day_summary\": сводка дня. Поле entry_date (\"YYYY-MM-DD\", \
по умолчанию сегодня).

Правила: entry_date указывай только если назван конкретный день (\"вчера\", \
дата); time — только если названо время суток. Числа пиши числами, не \
строками. Если текст не является командой дневника, ответь \
{\"action\": \"none\"}.";

/// Instructions for the meal-photo estimate. The canonical lines are what
/// the nutrition extractor parses.
const VISION_PROMPT: &str = "\
Оцени блюдо на фото для дневника диабета. Кратко опиши, что видишь, и \
обязательно закончи двумя строками строго в формате:\n\
Углеводы: N г\n\
ХЕ: N\n\
Если уверенности нет, дай диапазон вида 40-60 г.";

#[derive(Debug)]
pub enum GptError {
    /// The call exceeded its time budget.
    Timeout,
    /// The backend answered, but not with the expected shape.
    Malformed,
    Api(String),
}

impl std::fmt::Display for GptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GptError::Timeout => write!(f, "model call timed out"),
            GptError::Malformed => write!(f, "model reply had unexpected shape"),
            GptError::Api(msg) => write!(f, "model API error: {msg}"),
        }
    }
}

impl std::error::Error for GptError {}

/// A command recognized from free text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParsedCommand {
    pub action: String,
    #[serde(default)]
    pub entry_date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    /// Remaining action-specific fields (numbers, ids, reminder kind).
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl ParsedCommand {
    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Extract the first complete JSON object from free-form model output.
///
/// Models wrap JSON in prose or code fences often enough that a plain
/// `serde_json::from_str` on the whole reply is not workable. Scans for a
/// balanced top-level `{...}`, respecting string literals and escapes.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct GptClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GptClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    /// One chat-completion round trip with a single jittered retry on
    /// transport errors.
    async fn chat_completion(&self, messages: Value) -> Result<String, GptError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "messages": messages });

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            match self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => break resp,
                Err(e) if attempt < 2 => {
                    let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
                    warn!(error = %e, "Model request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS + jitter)).await;
                }
                Err(e) => return Err(GptError::Api(e.to_string())),
            }
        };

        if !response.status().is_success() {
            return Err(GptError::Api(format!("status {}", response.status())));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| GptError::Api(e.to_string()))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(GptError::Malformed)
    }

    /// Parse free text into a diary command. Returns `None` for timeouts,
    /// malformed replies and texts the model classifies as non-commands.
    pub async fn parse_command(&self, text: &str) -> Option<ParsedCommand> {
        let messages = json!([
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": text },
        ]);

        let reply = match tokio::time::timeout(
            Duration::from_secs(PARSE_TIMEOUT_SECS),
            self.chat_completion(messages),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(error = %e, "Command parse call failed");
                return None;
            }
            Err(_) => {
                warn!("Command parse timed out after {PARSE_TIMEOUT_SECS}s");
                return None;
            }
        };

        let value = extract_first_json(&reply)?;
        let command: ParsedCommand = serde_json::from_value(value).ok()?;
        if command.action == "none" || command.action.is_empty() {
            return None;
        }

        info!(action = %command.action, "Command recognized");
        Some(command)
    }

    /// Describe a meal photo, ending with the canonical nutrition lines.
    /// Takes a URL the backend can fetch (the Telegram file URL).
    pub async fn vision_estimate(&self, image_url: &str) -> Result<String, GptError> {
        let messages = json!([
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": VISION_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } },
                ],
            },
        ]);

        self.chat_completion(messages).await
    }

    /// Plain conversational fallback for text that is not a command.
    pub async fn chat(&self, text: &str) -> Result<String, GptError> {
        let messages = json!([
            {
                "role": "system",
                "content": "Ты — дружелюбный помощник по дневнику диабета. \
                            Отвечай кратко и по-русски. Не давай медицинских \
                            назначений, при сомнениях отправляй к врачу.",
            },
            { "role": "user", "content": text },
        ]);

        self.chat_completion(messages).await
    }
}
