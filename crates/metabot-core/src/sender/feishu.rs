//! Feishu sender.
//!
//! Talks to the open-platform HTTP API with a cached tenant access token.
//! Cards are interactive messages patched in place; attachments go through
//! the im images/files endpoints.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::render::render_card_text;
use super::{NoticeColor, PlatformSender};
use crate::outputs::platform_file_type;
use crate::stream::{CardState, CardStatus};

const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";

/// Renew the tenant token this long before Feishu's advertised expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(300);

pub struct FeishuSender {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl FeishuSender {
    pub fn new(app_id: &str, app_secret: &str) -> Self {
        Self::with_base_url(app_id, app_secret, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(app_id: &str, app_secret: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: Mutex::new(None),
        }
    }

    async fn tenant_token(&self) -> anyhow::Result<String> {
        if let Some(cached) = self.token.lock().unwrap().as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        let resp: Value = self
            .http
            .post(format!(
                "{}/open-apis/auth/v3/tenant_access_token/internal",
                self.base_url
            ))
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await
            .context("feishu token request failed")?
            .json()
            .await
            .context("feishu token response was not json")?;

        if resp.get("code").and_then(Value::as_i64).unwrap_or(-1) != 0 {
            bail!("feishu token error: {resp}");
        }
        let token = resp
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("feishu token missing in response"))?
            .to_string();
        let expire = resp.get("expire").and_then(Value::as_u64).unwrap_or(7200);

        *self.token.lock().unwrap() = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expire).saturating_sub(TOKEN_SLACK),
        });
        Ok(token)
    }

    async fn post_json(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let token = self.tenant_token().await?;
        let resp: Value = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("feishu POST {path} failed"))?
            .json()
            .await
            .with_context(|| format!("feishu POST {path} returned non-json"))?;
        check_code(path, resp)
    }

    async fn patch_json(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let token = self.tenant_token().await?;
        let resp: Value = self
            .http
            .patch(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("feishu PATCH {path} failed"))?
            .json()
            .await
            .with_context(|| format!("feishu PATCH {path} returned non-json"))?;
        check_code(path, resp)
    }

    async fn send_message(&self, chat_id: &str, msg_type: &str, content: Value) -> anyhow::Result<Value> {
        self.post_json(
            "/open-apis/im/v1/messages?receive_id_type=chat_id",
            json!({
                "receive_id": chat_id,
                "msg_type": msg_type,
                "content": content.to_string(),
            }),
        )
        .await
    }

    async fn upload(&self, path: &Path, endpoint: &str, form: reqwest::multipart::Form) -> anyhow::Result<Value> {
        let token = self.tenant_token().await?;
        let resp: Value = self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("feishu upload of {} failed", path.display()))?
            .json()
            .await
            .context("feishu upload returned non-json")?;
        check_code(endpoint, resp)
    }

    async fn download_resource(&self, message_id: &str, key: &str, kind: &str, save_path: &Path) -> bool {
        let token = match self.tenant_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Feishu token unavailable for download");
                return false;
            }
        };

        let url = format!(
            "{}/open-apis/im/v1/messages/{message_id}/resources/{key}?type={kind}",
            self.base_url
        );
        let resp = match self.http.get(url).bearer_auth(token).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(key, status = %resp.status(), "Feishu resource download rejected");
                return false;
            }
            Err(e) => {
                warn!(key, error = %e, "Feishu resource download failed");
                return false;
            }
        };

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Feishu resource body read failed");
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(save_path, &bytes).await {
            warn!(path = %save_path.display(), error = %e, "Failed to write downloaded resource");
            return false;
        }
        true
    }
}

fn check_code(path: &str, resp: Value) -> anyhow::Result<Value> {
    let code = resp.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code == 0 {
        return Ok(resp);
    }
    let msg = resp.get("msg").and_then(Value::as_str).unwrap_or("");
    // Updating a card to identical content is not an error worth surfacing.
    if msg.contains("not modified") || msg.contains("no change") {
        debug!(path, "Feishu reported unmodified content");
        return Ok(resp);
    }
    bail!("feishu {path} returned code {code}: {msg}")
}

/// Build the interactive card body for a state.
fn build_card(state: &CardState) -> Value {
    let template = match state.status {
        CardStatus::Thinking => "purple",
        CardStatus::Running => "blue",
        CardStatus::Complete => "green",
        CardStatus::Error => "red",
        CardStatus::WaitingForInput => "orange",
    };
    json!({
        "config": {"wide_screen_mode": true},
        "header": {
            "title": {"tag": "plain_text", "content": state.user_prompt},
            "template": template,
        },
        "elements": [{
            "tag": "div",
            "text": {"tag": "lark_md", "content": render_card_text(state)},
        }],
    })
}

#[async_trait]
impl PlatformSender for FeishuSender {
    async fn send_card(&self, chat_id: &str, state: &CardState) -> anyhow::Result<Option<String>> {
        let resp = self.send_message(chat_id, "interactive", build_card(state)).await?;
        Ok(resp
            .pointer("/data/message_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn update_card(&self, card_id: &str, state: &CardState) -> anyhow::Result<()> {
        self.patch_json(
            &format!("/open-apis/im/v1/messages/{card_id}"),
            json!({"content": build_card(state).to_string()}),
        )
        .await?;
        Ok(())
    }

    async fn send_text_notice(
        &self,
        chat_id: &str,
        title: &str,
        content: &str,
        color: NoticeColor,
    ) -> anyhow::Result<()> {
        let card = json!({
            "config": {"wide_screen_mode": true},
            "header": {
                "title": {"tag": "plain_text", "content": title},
                "template": color.template(),
            },
            "elements": [{
                "tag": "div",
                "text": {"tag": "lark_md", "content": content},
            }],
        });
        self.send_message(chat_id, "interactive", card).await?;
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.send_message(chat_id, "text", json!({"text": text})).await?;
        Ok(())
    }

    async fn send_image_file(&self, chat_id: &str, path: &Path) -> bool {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read image for upload");
                return false;
            }
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".into());
        let form = reqwest::multipart::Form::new()
            .text("image_type", "message")
            .part("image", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let resp = match self.upload(path, "/open-apis/im/v1/images", form).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Feishu image upload failed");
                return false;
            }
        };
        let Some(image_key) = resp.pointer("/data/image_key").and_then(Value::as_str) else {
            warn!(path = %path.display(), "Feishu image upload returned no key");
            return false;
        };

        match self.send_message(chat_id, "image", json!({"image_key": image_key})).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Feishu image message failed");
                false
            }
        }
    }

    async fn send_local_file(&self, chat_id: &str, path: &Path, name: &str) -> bool {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read file for upload");
                return false;
            }
        };
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let form = reqwest::multipart::Form::new()
            .text("file_type", platform_file_type(&ext))
            .text("file_name", name.to_owned())
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(name.to_owned()));

        let resp = match self.upload(path, "/open-apis/im/v1/files", form).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Feishu file upload failed");
                return false;
            }
        };
        let Some(file_key) = resp.pointer("/data/file_key").and_then(Value::as_str) else {
            warn!(path = %path.display(), "Feishu file upload returned no key");
            return false;
        };

        match self.send_message(chat_id, "file", json!({"file_key": file_key})).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Feishu file message failed");
                false
            }
        }
    }

    async fn download_image(&self, message_id: &str, key: &str, save_path: &Path) -> bool {
        self.download_resource(message_id, key, "image", save_path).await
    }

    async fn download_file(&self, message_id: &str, key: &str, save_path: &Path) -> bool {
        self.download_resource(message_id, key, "file", save_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_template_follows_status() {
        let mut state = CardState::thinking("prompt");
        assert_eq!(build_card(&state)["header"]["template"], "purple");
        state.status = CardStatus::Error;
        assert_eq!(build_card(&state)["header"]["template"], "red");
    }

    #[test]
    fn unmodified_update_is_not_an_error() {
        let resp = json!({"code": 230020, "msg": "card content not modified"});
        assert!(check_code("/patch", resp).is_ok());
        let resp = json!({"code": 99991, "msg": "invalid token"});
        assert!(check_code("/patch", resp).is_err());
    }
}
