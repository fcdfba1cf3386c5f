use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use super::{ConsoleEntry, PanelApi};
use crate::adapter::PanelConfig;
use crate::errors::TransportError;

/// Session value used when the panel authenticates through cookies only.
pub(crate) const COOKIE_SESSION: &str = "cookie-auth";

const SESSION_KEYS: [&str; 5] = [
    "sessionID",
    "SessionID",
    "session_id",
    "rememberMeToken",
    "RememberMeToken",
];

/// Body of `Core/Login`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    token: &'a str,
    remember_me: bool,
}

/// Find the session token of a login answer.
///
/// Keys are tried in a fixed order. A successful answer without any token means the panel
/// relies on its cookie.
pub(crate) fn extract_session_token(response: &Value) -> Option<String> {
    for key in SESSION_KEYS {
        if let Some(token) = response.get(key).and_then(Value::as_str) {
            if !token.is_empty() {
                return Some(token.to_owned());
            }
        }
    }

    let flagged = |key: &str| response.get(key).and_then(Value::as_bool) == Some(true);
    let result_ok = response.get("result").and_then(Value::as_i64) == Some(0);
    if flagged("success") || flagged("Success") || result_ok {
        return Some(COOKIE_SESSION.to_owned());
    }
    None
}

/// Reject answers that report a failure in their body.
pub(crate) fn check_api_error(endpoint: &str, response: &Value) -> Result<(), TransportError> {
    if response.get("success").and_then(Value::as_bool) == Some(false) {
        let message = ["message", "Message", "error", "resultReason"]
            .iter()
            .find_map(|key| response.get(*key).and_then(Value::as_str))
            .unwrap_or("unknown error");
        return Err(TransportError::Api {
            endpoint: endpoint.to_owned(),
            message: message.to_owned(),
        });
    }
    if response.get("Status").and_then(Value::as_bool) == Some(false) {
        return Err(TransportError::Api {
            endpoint: endpoint.to_owned(),
            message: "Status is false".to_owned(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Sessions {
    panel: Option<String>,
    instance: Option<String>,
}

/// HTTP client for the AMP panel API.
///
/// Every call is a JSON `POST` carrying `SESSIONID`. With an instance id, instance calls go
/// through the panel's ADS proxy (`/API/ADSModule/Servers/{id}/API/...`) using the session
/// obtained from the instance login.
pub struct AmpApiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    instance_id: Option<String>,
    sessions: Mutex<Sessions>,
}

impl AmpApiClient {
    pub fn new(config: &PanelConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            instance_id: config.instance_id.clone(),
            sessions: Mutex::new(Sessions::default()),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.sessions().panel.is_some()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn endpoint_url(&self, endpoint: &str, instance_scoped: bool) -> String {
        match (&self.instance_id, instance_scoped) {
            (Some(instance), true) => format!(
                "{}/API/ADSModule/Servers/{}/API/{}",
                self.base_url, instance, endpoint
            ),
            _ => format!("{}/API/{}", self.base_url, endpoint),
        }
    }

    fn session_id(&self, instance_scoped: bool) -> String {
        let sessions = self.sessions();
        let session = if instance_scoped {
            sessions.instance.as_ref().or(sessions.panel.as_ref())
        } else {
            sessions.panel.as_ref()
        };
        match session {
            Some(token) if token != COOKIE_SESSION => token.clone(),
            _ => String::new(),
        }
    }

    async fn call(
        &self,
        endpoint: &str,
        params: Value,
        instance_scoped: bool,
    ) -> Result<Value, TransportError> {
        let mut body = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert(
            "SESSIONID".to_owned(),
            Value::String(self.session_id(instance_scoped)),
        );

        let url = self.endpoint_url(endpoint, instance_scoped);
        debug!(url, "panel call");
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(TransportError::Status {
                endpoint: endpoint.to_owned(),
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| TransportError::InvalidResponse {
                endpoint: endpoint.to_owned(),
                reason: e.to_string(),
            })?;
        check_api_error(endpoint, &value)?;
        Ok(value)
    }

    fn login_params(&self) -> Value {
        let request = LoginRequest {
            username: &self.username,
            password: &self.password,
            token: "",
            remember_me: false,
        };
        serde_json::to_value(request).unwrap_or_else(|_| json!({}))
    }
}

#[async_trait]
impl PanelApi for AmpApiClient {
    #[instrument(skip_all, fields(user = %self.username))]
    async fn login(&self) -> Result<(), TransportError> {
        let response = self.call("Core/Login", self.login_params(), false).await?;
        let token = extract_session_token(&response).ok_or(TransportError::MissingSession)?;
        self.sessions().panel = Some(token);
        info!("logged in to panel");

        if let Some(instance) = &self.instance_id {
            match self.call("Core/Login", self.login_params(), true).await {
                Ok(response) => {
                    let token = extract_session_token(&response);
                    if token.is_none() {
                        warn!(instance, "instance login returned no session, using panel session");
                    }
                    self.sessions().instance = token;
                }
                Err(e) => {
                    warn!(instance, "instance login failed, using panel session: {e}");
                    self.sessions().instance = None;
                }
            }
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        if !self.is_authenticated() {
            return Ok(());
        }
        let result = self.call("Core/Logout", json!({}), false).await;
        *self.sessions() = Sessions::default();
        result.map(|_| ())
    }

    async fn get_updates(&self) -> Result<Vec<ConsoleEntry>, TransportError> {
        let response = self.call("Core/GetUpdates", json!({}), true).await?;
        let entries = response
            .get("ConsoleEntries")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let parsed = ConsoleEntry::from_value(entry);
                        if parsed.is_none() {
                            debug!(?entry, "skipping console entry");
                        }
                        parsed
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    async fn send_console_message(&self, message: String) -> Result<bool, TransportError> {
        self.call("Core/SendConsoleMessage", json!({ "message": message }), true)
            .await
            .map(|_| true)
    }

    async fn start_instance(&self) -> Result<bool, TransportError> {
        self.call("Core/Start", json!({}), true).await.map(|_| true)
    }

    async fn stop_instance(&self) -> Result<bool, TransportError> {
        self.call("Core/Stop", json!({}), true).await.map(|_| true)
    }

    async fn get_status(&self) -> Result<Value, TransportError> {
        self.call("Core/GetStatus", json!({}), true).await
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    fn client(instance_id: Option<&str>) -> AmpApiClient {
        let config = PanelConfig::from_credentials(
            "http://panel:8080",
            Some("admin:password"),
            instance_id.map(str::to_owned),
        )
        .unwrap();
        AmpApiClient::new(&config).unwrap()
    }

    #[test]
    fn login_body() {
        let params = client(None).login_params();
        assert_eq!(params["rememberMe"], false);
        assert_eq!(params["token"], "");
        assert!(params["username"].as_str().is_some_and(|name| !name.is_empty()));
    }

    #[test]
    fn session_keys_are_tried_in_order() {
        let response = json!({"SessionID": "second", "sessionID": "first"});
        assert_eq!(extract_session_token(&response).as_deref(), Some("first"));

        let response = json!({"rememberMeToken": "remember", "success": true});
        assert_eq!(extract_session_token(&response).as_deref(), Some("remember"));

        let response = json!({"session_id": "", "RememberMeToken": "last"});
        assert_eq!(extract_session_token(&response).as_deref(), Some("last"));
    }

    #[test]
    fn success_without_token_falls_back_to_cookie() {
        for response in [
            json!({"success": true}),
            json!({"Success": true}),
            json!({"result": 0}),
        ] {
            assert_eq!(
                extract_session_token(&response).as_deref(),
                Some(COOKIE_SESSION)
            );
        }
        assert_eq!(extract_session_token(&json!({"result": 5})), None);
        assert_eq!(extract_session_token(&json!({})), None);
    }

    #[test]
    fn failures_in_body_are_errors() {
        let failed = json!({"success": false, "resultReason": "bad password"});
        match check_api_error("Core/Login", &failed) {
            Err(TransportError::Api { message, .. }) => assert_eq!(message, "bad password"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_api_error("Core/Start", &json!({"Status": false})).is_err());
        assert!(check_api_error("Core/GetUpdates", &json!({"Status": {"State": 20}})).is_ok());
        assert!(check_api_error("Core/GetUpdates", &json!([])).is_ok());
    }

    #[test]
    fn instance_calls_go_through_the_proxy() {
        let direct = client(None);
        assert_eq!(
            direct.endpoint_url("Core/GetUpdates", true),
            "http://panel:8080/API/Core/GetUpdates"
        );

        let proxied = client(Some("abc-123"));
        assert_eq!(
            proxied.endpoint_url("Core/GetUpdates", true),
            "http://panel:8080/API/ADSModule/Servers/abc-123/API/Core/GetUpdates"
        );
        assert_eq!(
            proxied.endpoint_url("Core/Login", false),
            "http://panel:8080/API/Core/Login"
        );
    }

    #[test]
    fn cookie_session_is_not_sent_as_id() {
        let client = client(Some("abc"));
        assert!(!client.is_authenticated());
        client.sessions().panel = Some(COOKIE_SESSION.to_owned());
        assert!(client.is_authenticated());
        assert_eq!(client.session_id(false), "");

        client.sessions().instance = Some("instance-token".to_owned());
        assert_eq!(client.session_id(true), "instance-token");
        assert_eq!(client.session_id(false), "");
    }
}
