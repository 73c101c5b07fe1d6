//! HTTP client for the chat-bot open API: tenant-token auth plus text
//! messages to group chats.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobkit_types::{Notifier, NotifyError, TaskEvent, TaskRecord};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Refresh the tenant token this long before the platform expires it.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ListChatsResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<ListChatsData>,
}

#[derive(Debug, Deserialize)]
struct ListChatsData {
    #[serde(default)]
    items: Vec<ChatItem>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatItem {
    chat_id: String,
}

struct CachedToken {
    token: String,
    refresh_after: Instant,
}

/// Bot that posts task lifecycle messages into group chats.
///
/// Holds the tenant access token in-process and refreshes it shortly before
/// expiry; per-chat send failures are logged and do not stop the remaining
/// sends.
pub struct ChatBotNotifier {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    chat_ids: Vec<String>,
    token: Mutex<Option<CachedToken>>,
}

impl ChatBotNotifier {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        chat_ids: Vec<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            chat_ids,
            token: Mutex::new(None),
        }
    }

    /// Build from `CHATBOT_BASE_URL`, `CHATBOT_APP_ID`, `CHATBOT_APP_SECRET`
    /// and comma-separated `CHATBOT_CHAT_IDS`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("CHATBOT_BASE_URL")
            .unwrap_or_else(|_| "https://open.feishu.cn".to_string());
        let app_id = std::env::var("CHATBOT_APP_ID").unwrap_or_default();
        let app_secret = std::env::var("CHATBOT_APP_SECRET").unwrap_or_default();
        let chat_ids = std::env::var("CHATBOT_CHAT_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self::new(base_url, app_id, app_secret, chat_ids)
    }

    async fn tenant_token(&self) -> Result<String, NotifyError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.refresh_after {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let parsed: TokenResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Auth(e.to_string()))?
            .json()
            .await
            .map_err(|e| NotifyError::Auth(e.to_string()))?;
        if parsed.code != 0 {
            return Err(NotifyError::Auth(format!(
                "tenant token request failed, code: {}, msg: {}",
                parsed.code, parsed.msg
            )));
        }
        let token = parsed
            .tenant_access_token
            .ok_or_else(|| NotifyError::Auth("token response missing tenant_access_token".to_string()))?;
        let ttl = Duration::from_secs(parsed.expire.unwrap_or(0));
        *guard = Some(CachedToken {
            token: token.clone(),
            refresh_after: Instant::now() + ttl.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(token)
    }

    /// Send a plain-text message to one group chat.
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let token = self.tenant_token().await?;
        let url = format!("{}/open-apis/im/v1/messages", self.base_url);
        let body = serde_json::json!({
            "receive_id": chat_id,
            "msg_type": "text",
            "content": serde_json::json!({ "text": text }).to_string(),
        });
        let parsed: SendMessageResponse = self
            .client
            .post(&url)
            .query(&[("receive_id_type", "chat_id")])
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Send(e.to_string()))?
            .json()
            .await
            .map_err(|e| NotifyError::Send(e.to_string()))?;
        if parsed.code != 0 {
            return Err(NotifyError::Send(format!(
                "message create failed, code: {}, msg: {}",
                parsed.code, parsed.msg
            )));
        }
        Ok(())
    }

    /// List the ids of every group chat the bot can see, following
    /// pagination to the end.
    pub async fn list_group_chats(&self, page_size: u32) -> Result<Vec<String>, NotifyError> {
        let token = self.tenant_token().await?;
        let url = format!("{}/open-apis/im/v1/chats", self.base_url);
        let mut chat_ids = Vec::new();
        let mut page_token = String::new();

        loop {
            let parsed: ListChatsResponse = self
                .client
                .get(&url)
                .query(&[
                    ("page_size", page_size.to_string()),
                    ("page_token", page_token.clone()),
                ])
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| NotifyError::Send(e.to_string()))?
                .json()
                .await
                .map_err(|e| NotifyError::Send(e.to_string()))?;
            if parsed.code != 0 {
                return Err(NotifyError::Send(format!(
                    "chat list failed, code: {}, msg: {}",
                    parsed.code, parsed.msg
                )));
            }
            let Some(data) = parsed.data else { break };
            chat_ids.extend(data.items.into_iter().map(|item| item.chat_id));
            match data.page_token {
                Some(next) if !next.is_empty() => page_token = next,
                _ => break,
            }
        }
        Ok(chat_ids)
    }

    fn message_for(event: TaskEvent, record: &TaskRecord) -> String {
        match event {
            TaskEvent::Submitted => format!(
                "Task `{}` ({}) submitted, current state `{}`",
                record.name, record.id, record.state
            ),
            TaskEvent::Terminated => format!(
                "Task `{}` ({}) finished in state `{}`",
                record.name, record.id, record.state
            ),
        }
    }
}

#[async_trait]
impl Notifier for ChatBotNotifier {
    async fn notify(&self, event: TaskEvent, record: &TaskRecord) -> Result<(), NotifyError> {
        let text = Self::message_for(event, record);
        let mut last_error = None;
        for chat_id in &self.chat_ids {
            if let Err(error) = self.send_text(chat_id, &text).await {
                tracing::warn!(chat_id = %chat_id, %error, "chat message send failed");
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
