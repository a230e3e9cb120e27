//! HTTP sync handler for the Music Locker web app.
//!
//! Each queued [`Action`] maps to one POST. JSON endpoints answer with
//! `{"success": bool, "message": …}`; the form endpoints (add/edit) only
//! signal through the status code.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, RequestBuilder};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::ApiConfig;
use crate::queue::{Action, SyncHandler};

const CSRF_HEADER: &str = "X-CSRF-TOKEN";
const CSRF_FIELD: &str = "csrf_token";

/// Request body for one action, before the CSRF token is added.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Map<String, Value>),
    Form(Vec<(String, String)>),
}

/// Endpoint path and body for `action`.
pub fn request_for(action: &Action) -> (String, RequestBody) {
    fn body(value: Value) -> RequestBody {
        match value {
            Value::Object(map) => RequestBody::Json(map),
            _ => RequestBody::Json(Map::new()),
        }
    }

    match action {
        Action::ToggleFavorite { entry_id } => {
            ("/api/music/favorite".to_string(), body(json!({ "entry_id": entry_id })))
        }
        Action::UpdateRating { entry_id, rating } => {
            (format!("/music/{entry_id}/rate"), body(json!({ "rating": rating })))
        }
        Action::DeleteEntry { entry_id } => (format!("/music/{entry_id}/delete"), body(json!({}))),
        Action::AddEntry(form) => ("/music/add".to_string(), RequestBody::Form(form.to_pairs())),
        Action::UpdateEntry { entry_id, fields } => {
            (format!("/music/{entry_id}/edit"), RequestBody::Form(fields.to_pairs()))
        }
        Action::AddNote { entry_id, note_text, mood } => (
            format!("/music/{entry_id}/notes"),
            body(json!({ "note_text": note_text, "mood": mood })),
        ),
        Action::AddTag { entry_id, tag_id } => {
            (format!("/music/{entry_id}/tags"), body(json!({ "tag_id": tag_id })))
        }
    }
}

/// Loose truthiness, matching what the web app's own scripts accept.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

pub struct ApiClient {
    http: HttpClient,
    base_url: String,
    csrf_token: Option<String>,
    session_cookie: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout())
            .user_agent(concat!("music-locker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            csrf_token: config.resolved_csrf_token(),
            session_cookie: config.session_cookie.clone().filter(|c| !c.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_csrf_token(&self) -> bool {
        self.csrf_token.is_some()
    }

    /// Whether the server answers at all. Any HTTP response counts.
    pub async fn is_reachable(&self) -> bool {
        match self.http.get(&self.base_url).send().await {
            Ok(resp) => {
                debug!("Reachability probe: HTTP {}", resp.status());
                true
            }
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }

    fn post(&self, path: &str, token: &str) -> RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(header::ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(CSRF_HEADER, token);
        if let Some(cookie) = &self.session_cookie {
            req = req.header(header::COOKIE, cookie);
        }
        req
    }

    async fn post_json(&self, path: &str, token: &str, mut body: Map<String, Value>) -> Result<()> {
        body.insert(CSRF_FIELD.to_string(), Value::String(token.to_string()));

        let resp = self
            .post(path, token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("POST {} returned HTTP {}", path, status);
        }

        let reply: Value = resp
            .json()
            .await
            .with_context(|| format!("POST {path} returned a non-JSON body"))?;
        if !is_truthy(reply.get("success")) {
            let message = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            bail!("POST {} was rejected: {}", path, message);
        }
        Ok(())
    }

    async fn post_form(&self, path: &str, token: &str, mut fields: Vec<(String, String)>) -> Result<()> {
        fields.push((CSRF_FIELD.to_string(), token.to_string()));

        let resp = self
            .post(path, token)
            .form(&fields)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("POST {} returned HTTP {}", path, status);
        }
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for ApiClient {
    async fn sync(&self, action: &Action) -> Result<()> {
        let Some(token) = self.csrf_token.as_deref() else {
            bail!("No CSRF token configured (set api.csrf_token or MUSIC_LOCKER_CSRF_TOKEN)");
        };

        let (path, body) = request_for(action);
        debug!("Syncing {} via POST {}", action.name(), path);
        match body {
            RequestBody::Json(map) => self.post_json(&path, token, map).await,
            RequestBody::Form(fields) => self.post_form(&path, token, fields).await,
        }
    }
}
