//! Authenticated session with the wallbox web API
//!
//! The web interface exposes data that Modbus does not carry (versions,
//! network details, counters, LED brightness, free charging). Access needs a
//! JWT obtained from `/login`. [`RestSession`] refreshes the token before it
//! expires, recovers once from an authentication failure by logging in
//! again, and retries network-level failures with exponential backoff.

use crate::catalog::{Binding, RegisterCatalog, RegisterDefinition, ValueType};
use crate::config::RestConfig;
use crate::error::{Result, WallboxError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::snapshot::{FieldValue, Fragment};
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

pub mod parse;

/// Authenticated API session
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Usable without refresh at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        now < self.expires_at - margin
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ConfigurationField {
    #[serde(rename = "fieldKey", default)]
    field_key: String,
    #[serde(default)]
    value: Value,
}

const CONFIGURATION_UPDATES_PATH: &str = "/configuration-updates";
const CURRENT_ERRORS_PATH: &str = "/current-errors";
const FREE_CHARGING_ALIAS_FIELDS: [&str; 2] = ["free-charging-alais", "free-charging-alias"];

pub struct RestSession {
    base_url: String,
    config: RestConfig,
    /// `None` after `close()`; rebuilt on next use
    http: Mutex<Option<reqwest::Client>>,
    /// Held while a token is checked or refreshed
    session: Mutex<Option<Session>>,
    logger: StructuredLogger,
}

impl RestSession {
    pub fn new(config: &RestConfig, fallback_host: &str) -> Self {
        let base_url = config.resolved_base_url(fallback_host);
        let logger =
            get_logger_with_context(LogContext::new("rest").with_endpoint(base_url.clone()));
        Self {
            base_url,
            config: config.clone(),
            http: Mutex::new(None),
            session: Mutex::new(None),
            logger,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn refresh_margin(&self) -> ChronoDuration {
        clamped_seconds(self.config.refresh_margin_secs)
    }

    fn default_lifetime(&self) -> ChronoDuration {
        clamped_seconds(self.config.token_lifetime_secs)
    }

    async fn client(&self) -> Result<reqwest::Client> {
        let mut http = self.http.lock().await;
        if let Some(client) = http.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs.max(1)))
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()?;
        *http = Some(client.clone());
        Ok(client)
    }

    fn build_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.config.initial_backoff_ms.max(1));
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: initial * 8,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }

    /// Send one request, retrying only network-level failures
    async fn send_with_retry(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.build_backoff();

        for attempt in 1..=attempts {
            let client = self.client().await?;
            let mut request = client
                .request(method.clone(), &url)
                .header(header::ACCEPT, "application/json");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    self.logger.warn(&format!(
                        "Attempt {attempt}/{attempts} to {method} {path} failed: {e}"
                    ));
                    if attempt == attempts {
                        return Err(e.into());
                    }
                    // Force a fresh connection pool on the next attempt
                    self.http.lock().await.take();
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.config.initial_backoff_ms));
                    sleep(delay).await;
                }
            }
        }

        Err(WallboxError::network(format!(
            "Request to {path} failed after {attempts} attempts"
        )))
    }

    /// Authenticate and store a new session
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let mut guard = self.session.lock().await;
        let session = self.login_locked(username, password).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn login_locked(&self, username: &str, password: &str) -> Result<Session> {
        let payload = json!({ "username": username, "password": password });
        let response = self
            .send_with_retry(&Method::POST, "/login", Some(&payload), None)
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(WallboxError::auth_expired("Invalid username or password"));
        }
        if !status.is_success() {
            return Err(WallboxError::auth_expired(format!(
                "Login failed with status {}",
                status.as_u16()
            )));
        }

        let body: LoginResponse = response.json().await?;
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WallboxError::auth_expired("No access_token in response"))?;

        let issued_at = Utc::now();
        let lifetime = body
            .expires_in
            .filter(|s| *s > 0)
            .map_or_else(|| self.default_lifetime(), |s| clamped_seconds(s.unsigned_abs()));

        self.logger.debug("Successfully authenticated to REST API");
        Ok(Session {
            access_token,
            issued_at,
            expires_at: issued_at + lifetime,
        })
    }

    /// Token that stays valid beyond the refresh margin
    async fn valid_token(&self) -> Result<String> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_fresh(Utc::now(), self.refresh_margin()) {
                return Ok(session.access_token.clone());
            }
            self.logger.debug("Token within refresh margin; logging in again");
        }
        *guard = None;
        let session = self
            .login_locked(&self.config.username, &self.config.password)
            .await?;
        let token = session.access_token.clone();
        *guard = Some(session);
        Ok(token)
    }

    /// Current session, if any
    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    /// Drop the session only if it still carries the refused `token`
    ///
    /// Concurrent requests refused with the same token leave a session that
    /// another request already renewed in place.
    async fn discard_token(&self, token: &str) -> bool {
        let mut guard = self.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|session| session.access_token == token)
        {
            *guard = None;
            true
        } else {
            false
        }
    }

    /// Issue an authenticated request
    ///
    /// An authentication failure with a fresh token invalidates the session
    /// and the request is retried once after a new login. Other 4xx/5xx
    /// statuses are returned as [`WallboxError::Http`] without retry.
    pub async fn authorized_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut recovered = false;

        loop {
            let token = self.valid_token().await?;
            let response = self
                .send_with_retry(&method, path, body, Some(&token))
                .await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                if recovered {
                    self.discard_token(&token).await;
                    return Err(WallboxError::auth_expired(format!(
                        "{method} {path} refused after re-login ({})",
                        status.as_u16()
                    )));
                }
                if self.discard_token(&token).await {
                    self.logger.debug(&format!(
                        "Token refused ({}), re-authenticating",
                        status.as_u16()
                    ));
                }
                recovered = true;
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(WallboxError::http(status.as_u16(), path, text));
            }

            let is_json = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("application/json"));
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            if is_json {
                return Ok(serde_json::from_str(&text)?);
            }
            return Ok(Value::String(text));
        }
    }

    async fn get_section(&self, section: &str) -> Result<Vec<ConfigurationField>> {
        let value = self
            .authorized_request(Method::GET, &format!("/sections/{section}"), None)
            .await?;
        Ok(match value {
            Value::Array(_) => serde_json::from_value(value)?,
            _ => Vec::new(),
        })
    }

    /// Read every REST-owned key of `catalog`
    ///
    /// Sections are fetched independently; keys of a failed section are
    /// absent. An error is returned only when no section could be fetched
    /// because authentication or the network failed outright.
    pub async fn fetch_fragment(&self, catalog: &RegisterCatalog) -> Result<Fragment> {
        // Authenticate once up front so the three requests share one login
        self.valid_token().await?;

        let (system, auth, errors) = tokio::join!(
            self.get_section("system"),
            self.get_section("auth"),
            self.authorized_request(Method::GET, CURRENT_ERRORS_PATH, None),
        );

        let mut fields: HashMap<String, Value> = HashMap::new();
        for (name, section) in [("system", system), ("auth", auth)] {
            match section {
                Ok(entries) => {
                    for entry in entries {
                        fields.insert(entry.field_key, entry.value);
                    }
                }
                Err(e) => self
                    .logger
                    .warn(&format!("Failed to fetch {name} section: {e}")),
            }
        }
        let errors = match errors {
            Ok(value) => Some(parse::parse_errors(&value)),
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to fetch current errors: {e}"));
                None
            }
        };

        let mut fragment = Fragment::new();
        for def in catalog.rest_readable() {
            let Binding::Rest { field } = &def.binding else {
                continue;
            };
            let value = if field == CURRENT_ERRORS_PATH.trim_start_matches('/') {
                errors.clone().map(FieldValue::TextList)
            } else {
                field_value(def, field, &fields)
            };
            fragment.insert(def.key.clone(), value);
        }
        Ok(fragment)
    }

    /// Write one REST-owned configuration field
    pub async fn write_field(&self, def: &RegisterDefinition, value: &FieldValue) -> Result<()> {
        let Binding::Rest { field } = &def.binding else {
            return Err(WallboxError::write_rejected(
                def.key.clone(),
                "Key is not owned by the web API",
            ));
        };

        if def.value_type == ValueType::Trigger {
            self.authorized_request(Method::POST, field, None).await?;
            return Ok(());
        }

        let (json_value, update_type) = match (def.value_type, value) {
            (ValueType::Integer, FieldValue::Int(v)) => {
                (json!(v), "number-configuration-field-update")
            }
            (ValueType::Integer, FieldValue::Float(v)) => {
                (json!(v.round() as i64), "number-configuration-field-update")
            }
            (ValueType::Float, v) => match v.as_f64() {
                Some(f) => (json!(f), "number-configuration-field-update"),
                None => return Err(type_mismatch(def, value)),
            },
            (ValueType::Bool, FieldValue::Bool(b)) => {
                (json!(b), "boolean-configuration-field-update")
            }
            (ValueType::Text, FieldValue::Text(s)) => {
                (json!(s), "simple-string-configuration-field-update")
            }
            _ => return Err(type_mismatch(def, value)),
        };

        let (field_key, _) = split_selector(field);
        let body = json!([{
            "fieldKey": field_key,
            "value": json_value,
            "configurationFieldUpdateType": update_type,
        }]);
        self.authorized_request(Method::POST, CONFIGURATION_UPDATES_PATH, Some(&body))
            .await?;
        self.logger.info(&format!("Updated {field_key} to {value}"));
        Ok(())
    }

    /// Ask the wallbox to reboot
    pub async fn restart_system(&self) -> Result<()> {
        self.authorized_request(Method::POST, "/custom-actions/restart-system", None)
            .await
            .map(|_| ())
    }

    /// Drop the session and the HTTP connection pool
    pub async fn close(&self) {
        self.session.lock().await.take();
        if self.http.lock().await.take().is_some() {
            self.logger.debug("REST client closed");
        }
    }
}

const MAX_TOKEN_SECS: u64 = 365 * 24 * 3600;

fn clamped_seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(MAX_TOKEN_SECS) as i64)
}

fn type_mismatch(def: &RegisterDefinition, value: &FieldValue) -> WallboxError {
    WallboxError::write_rejected(
        def.key.clone(),
        format!("{value:?} does not match {:?}", def.value_type),
    )
}

fn split_selector(field: &str) -> (&str, Option<&str>) {
    match field.split_once(':') {
        Some((name, selector)) => (name, Some(selector)),
        None => (field, None),
    }
}

fn field_value(
    def: &RegisterDefinition,
    field: &str,
    fields: &HashMap<String, Value>,
) -> Option<FieldValue> {
    let (name, selector) = split_selector(field);

    let raw = if FREE_CHARGING_ALIAS_FIELDS.contains(&name) {
        FREE_CHARGING_ALIAS_FIELDS
            .iter()
            .find_map(|alias| fields.get(*alias))
    } else {
        fields.get(name)
    }?;

    if name == "signal-voltage" {
        let voltages = parse::parse_signal_voltages(raw)?;
        return voltages.phase(selector?).map(FieldValue::Float);
    }
    if name == "interfaces" {
        return raw.as_str().and_then(parse::extract_ip).map(FieldValue::Text);
    }

    match def.value_type {
        ValueType::Integer => parse::safe_int(raw).map(FieldValue::Int),
        ValueType::Float => parse::safe_float(raw).map(FieldValue::Float),
        ValueType::Bool => parse::safe_bool(raw).map(FieldValue::Bool),
        ValueType::Text => parse::safe_text(raw).map(FieldValue::Text),
        ValueType::TextList => match raw {
            Value::Array(items) => Some(FieldValue::TextList(
                items.iter().filter_map(parse::safe_text).collect(),
            )),
            _ => None,
        },
        _ => None,
    }
}
