use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::graph::{BlockKind, Button, ButtonKind, ContentBlock, Product};

/// Prefix for callback payloads that navigate to a node.
pub const NAV_PREFIX: &str = "node_";
/// Prefix for callback payloads that request a product invoice.
pub const PAY_PREFIX: &str = "pay_";

/// Inbound webhook envelope. Fields we do not consume are ignored; an
/// envelope that is neither a message nor a callback is acknowledged and
/// dropped by the engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
}

/// What a callback payload decodes to. Navigation and payment use distinct
/// fixed prefixes so decoding never needs a state lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Navigate(String),
    Pay(String),
}

pub fn encode_navigate(node_id: &str) -> String {
    format!("{NAV_PREFIX}{node_id}")
}

pub fn encode_pay(product_id: &str) -> String {
    format!("{PAY_PREFIX}{product_id}")
}

pub fn decode_callback(data: &str) -> Option<CallbackAction> {
    if let Some(node_id) = data.strip_prefix(NAV_PREFIX) {
        Some(CallbackAction::Navigate(node_id.to_string()))
    } else if let Some(product_id) = data.strip_prefix(PAY_PREFIX) {
        Some(CallbackAction::Pay(product_id.to_string()))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl From<&Button> for InlineKeyboardButton {
    fn from(button: &Button) -> Self {
        let (url, callback_data) = match button.kind {
            ButtonKind::Url => (Some(button.value.clone()), None),
            ButtonKind::Node => (None, Some(encode_navigate(&button.value))),
            ButtonKind::Pay => (None, Some(encode_pay(&button.value))),
        };
        InlineKeyboardButton {
            text: button.text.clone(),
            url,
            callback_data,
        }
    }
}

/// Pack buttons two per row, in original order, row-major.
pub fn keyboard_rows(buttons: &[Button]) -> Vec<Vec<InlineKeyboardButton>> {
    buttons
        .chunks(2)
        .map(|row| row.iter().map(InlineKeyboardButton::from).collect())
        .collect()
}

/// Price in the Bot API's minor-unit integer representation.
pub fn minor_units(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The API answered `ok: false`; carries the platform's description.
    #[error("telegram rejected {method}: {description}")]
    Api { method: String, description: String },
    #[error("telegram transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid telegram api url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

/// Outbound seam between the engine and the messaging platform. The real
/// implementation is [`TelegramApi`]; tests substitute a recording double.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send the blocks in order as discrete messages; the keyboard, if any,
    /// is attached only to the last one.
    async fn send_blocks(
        &self,
        token: &str,
        chat_id: &str,
        blocks: &[ContentBlock],
        keyboard: &[Button],
    ) -> Result<(), SendError>;

    /// Issue a single-item invoice for the product, correlatable back to
    /// `(payer, product)` via the deterministic payload.
    async fn send_invoice(
        &self,
        token: &str,
        chat_id: &str,
        product: &Product,
        payer: &str,
    ) -> Result<(), SendError>;
}

/// Thin Bot API client. One instance serves every bot; the token is passed
/// per call because each bot carries its own.
#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base: Url,
    provider_token: Option<String>,
}

impl TelegramApi {
    pub fn new(base: Url, provider_token: Option<String>) -> Result<Self, SendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base,
            provider_token,
        })
    }

    async fn call(&self, token: &str, method: &str, params: Value) -> Result<Value, SendError> {
        let url = self.base.join(&format!("bot{token}/{method}"))?;
        debug!(%method, "telegram api call");
        let response = self.http.post(url).json(&params).send().await?;
        let body: ApiResponse = response.json().await?;
        if body.ok {
            Ok(body.result.unwrap_or(Value::Null))
        } else {
            Err(SendError::Api {
                method: method.to_string(),
                description: body
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

fn block_params(chat_id: &str, block: &ContentBlock) -> (&'static str, Value) {
    match block.kind {
        BlockKind::Text => {
            let mut params = json!({
                "chat_id": chat_id,
                "text": block.content.clone().unwrap_or_default(),
            });
            if block.settings.disable_preview {
                params["disable_web_page_preview"] = json!(true);
            }
            ("sendMessage", params)
        }
        BlockKind::Image => {
            let mut params = json!({
                "chat_id": chat_id,
                "photo": block.url.clone().unwrap_or_default(),
            });
            if block.settings.spoiler {
                params["has_spoiler"] = json!(true);
            }
            ("sendPhoto", params)
        }
        BlockKind::Video => {
            let mut params = json!({
                "chat_id": chat_id,
                "video": block.url.clone().unwrap_or_default(),
            });
            if block.settings.spoiler {
                params["has_spoiler"] = json!(true);
            }
            ("sendVideo", params)
        }
    }
}

fn invoice_params(
    chat_id: &str,
    product: &Product,
    payer: &str,
    provider_token: Option<&str>,
) -> Value {
    json!({
        "chat_id": chat_id,
        "title": product.name,
        "description": product
            .description
            .clone()
            .unwrap_or_else(|| "Digital Product".to_string()),
        "payload": format!("order_{payer}_{}", product.id),
        "provider_token": provider_token.unwrap_or_default(),
        "currency": product.currency.clone().unwrap_or_else(|| "USD".to_string()),
        "prices": [{"label": "Price", "amount": minor_units(product.price)}],
        "start_parameter": "shop",
    })
}

#[async_trait]
impl Outbound for TelegramApi {
    async fn send_blocks(
        &self,
        token: &str,
        chat_id: &str,
        blocks: &[ContentBlock],
        keyboard: &[Button],
    ) -> Result<(), SendError> {
        let last = blocks.len().saturating_sub(1);
        for (i, block) in blocks.iter().enumerate() {
            let (method, mut params) = block_params(chat_id, block);
            if i == last && !keyboard.is_empty() {
                params["reply_markup"] = json!({"inline_keyboard": keyboard_rows(keyboard)});
            }
            self.call(token, method, params).await?;
        }
        Ok(())
    }

    async fn send_invoice(
        &self,
        token: &str,
        chat_id: &str,
        product: &Product,
        payer: &str,
    ) -> Result<(), SendError> {
        let params = invoice_params(chat_id, product, payer, self.provider_token.as_deref());
        self.call(token, "sendInvoice", params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BlockSettings;
    use axum::{Extension, Json, Router, extract::Path, routing::post};
    use std::sync::{Arc, Mutex};

    fn button(id: &str, kind: ButtonKind, value: &str) -> Button {
        Button {
            id: id.to_string(),
            text: id.to_uppercase(),
            kind,
            value: value.to_string(),
        }
    }

    fn text_block(content: &str) -> ContentBlock {
        ContentBlock {
            id: String::new(),
            kind: BlockKind::Text,
            content: Some(content.to_string()),
            url: None,
            settings: BlockSettings::default(),
        }
    }

    #[test]
    fn test_keyboard_rows_pack_two_per_row() {
        let buttons = vec![
            button("b1", ButtonKind::Url, "https://x"),
            button("b2", ButtonKind::Node, "n2"),
            button("b3", ButtonKind::Pay, "p3"),
            button("b4", ButtonKind::Url, "https://y"),
        ];
        let rows = keyboard_rows(&buttons);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[1].len(), 2);
        assert_eq!(rows[0][0].url.as_deref(), Some("https://x"));
        assert_eq!(rows[0][1].callback_data.as_deref(), Some("node_n2"));
        assert_eq!(rows[1][0].callback_data.as_deref(), Some("pay_p3"));

        let odd = keyboard_rows(&buttons[..3]);
        assert_eq!(odd.len(), 2);
        assert_eq!(odd[0].len(), 2);
        assert_eq!(odd[1].len(), 1);
    }

    #[test]
    fn test_callback_codec_roundtrip() {
        assert_eq!(
            decode_callback(&encode_navigate("abc")),
            Some(CallbackAction::Navigate("abc".into()))
        );
        assert_eq!(
            decode_callback(&encode_pay("p1")),
            Some(CallbackAction::Pay("p1".into()))
        );
        assert_eq!(decode_callback("noop"), None);
        // prefixes must never shadow one another
        assert!(!NAV_PREFIX.starts_with(PAY_PREFIX));
        assert!(!PAY_PREFIX.starts_with(NAV_PREFIX));
    }

    #[test]
    fn test_minor_units_rounding() {
        assert_eq!(minor_units(19.99), 1999);
        assert_eq!(minor_units(10.0), 1000);
        assert_eq!(minor_units(10.555), 1056);
    }

    #[test]
    fn test_invoice_params_deterministic() {
        let product = Product {
            id: "p1".into(),
            name: "Course".into(),
            description: None,
            price: 19.99,
            currency: None,
        };
        let params = invoice_params("42", &product, "42", Some("prov"));
        assert_eq!(params["payload"], "order_42_p1");
        assert_eq!(params["description"], "Digital Product");
        assert_eq!(params["currency"], "USD");
        assert_eq!(params["prices"][0]["amount"], 1999);
        assert_eq!(params["start_parameter"], "shop");
        // repeatable: correlation depends only on payer and product
        assert_eq!(params, invoice_params("42", &product, "42", Some("prov")));
    }

    type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

    /// Minimal Bot API stand-in: records every call, fails any sendMessage
    /// whose text is "boom".
    async fn fake_api(
        Path((_bot, method)): Path<(String, String)>,
        Extension(log): Extension<CallLog>,
        Json(params): Json<Value>,
    ) -> Json<Value> {
        log.lock().unwrap().push((method.clone(), params.clone()));
        if params["text"] == "boom" {
            return Json(json!({"ok": false, "description": "kaboom"}));
        }
        Json(json!({"ok": true, "result": {}}))
    }

    async fn spawn_fake_api() -> (Url, CallLog) {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/:bot/:method", post(fake_api))
            .layer(Extension(log.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        (base, log)
    }

    #[tokio::test]
    async fn test_send_blocks_attaches_keyboard_to_last_only() {
        let (base, log) = spawn_fake_api().await;
        let api = TelegramApi::new(base, None).unwrap();

        let blocks = vec![text_block("first"), text_block("second")];
        let keyboard = vec![button("b1", ButtonKind::Node, "n1")];
        api.send_blocks("TOKEN", "7", &blocks, &keyboard)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sendMessage");
        assert!(calls[0].1.get("reply_markup").is_none());
        assert_eq!(
            calls[1].1["reply_markup"]["inline_keyboard"][0][0]["callback_data"],
            "node_n1"
        );
    }

    #[tokio::test]
    async fn test_send_blocks_stops_on_api_error() {
        let (base, log) = spawn_fake_api().await;
        let api = TelegramApi::new(base, None).unwrap();

        let blocks = vec![text_block("boom"), text_block("never sent")];
        let err = api
            .send_blocks("TOKEN", "7", &blocks, &[])
            .await
            .unwrap_err();
        match err {
            SendError::Api { description, .. } => assert_eq!(description, "kaboom"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_media_blocks_use_media_methods() {
        let (base, log) = spawn_fake_api().await;
        let api = TelegramApi::new(base, None).unwrap();

        let blocks = vec![ContentBlock {
            id: String::new(),
            kind: BlockKind::Image,
            content: None,
            url: Some("https://cdn/x.png".into()),
            settings: BlockSettings {
                disable_preview: false,
                spoiler: true,
            },
        }];
        api.send_blocks("TOKEN", "7", &blocks, &[]).await.unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls[0].0, "sendPhoto");
        assert_eq!(calls[0].1["photo"], "https://cdn/x.png");
        assert_eq!(calls[0].1["has_spoiler"], true);
    }
}
