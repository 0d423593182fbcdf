use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::adapters::{Authenticator, FeedClient, FeedEntry, GameClient, RemoteGame};
use crate::error::SourceError;
use crate::snapshot::{AchievementMetadata, Credentials};
use crate::sync::RemoteAchievement;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

/// JSON-over-HTTP source speaking the lifelog collector contract.
#[derive(Debug, Clone)]
pub struct HttpSourceClient {
    base_url: String,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataRequest<'a> {
    api_names: &'a [String],
}

impl HttpSourceClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("source base url is missing");
        }
        let timeout_ms = if config.timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            config.timeout_ms.max(250)
        };

        Ok(Self {
            base_url,
            token_url: non_empty(config.token_url),
            client_id: non_empty(config.client_id),
            client_secret: non_empty(config.client_secret),
            api_key: non_empty(config.api_key),
            timeout: Duration::from_millis(timeout_ms),
            http: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim().trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
        let request = request.timeout(self.timeout);
        let request = match credentials {
            Some(credentials) => request.bearer_auth(&credentials.access_token),
            None => request,
        };
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<T, SourceError> {
        let request = self.authorize(self.http.get(self.endpoint(path)), credentials);
        decode_json_response(request.send().await?).await
    }

    /// A JSON array whose malformed elements are dropped one by one.
    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<T>, SourceError> {
        let raw: Vec<serde_json::Value> = self.get_json(path, credentials).await?;
        Ok(decode_items(path, raw))
    }

    async fn post_json<Req, Res>(
        &self,
        path: &str,
        payload: &Req,
        credentials: Option<&Credentials>,
    ) -> Result<Res, SourceError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let request = self
            .authorize(self.http.post(self.endpoint(path)), credentials)
            .json(payload);
        decode_json_response(request.send().await?).await
    }
}

impl Authenticator for HttpSourceClient {
    fn requires_auth(&self) -> bool {
        self.token_url.is_some()
    }

    async fn refresh_credentials(
        &self,
        current: Option<&Credentials>,
    ) -> Result<Credentials, SourceError> {
        let Some(token_url) = &self.token_url else {
            return Err(SourceError::Auth("no token url configured".into()));
        };

        let refresh_token = current.and_then(|c| c.refresh_token.as_deref());
        let payload = TokenRequest {
            grant_type: if refresh_token.is_some() {
                "refresh_token"
            } else {
                "client_credentials"
            },
            refresh_token,
            client_id: self.client_id.as_deref(),
            client_secret: self.client_secret.as_deref(),
        };

        let response = self
            .http
            .post(token_url.as_str())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;
        let token: TokenResponse = decode_json_response(response).await?;

        Ok(Credentials {
            access_token: token.access_token,
            // Providers that do not rotate refresh tokens omit them.
            refresh_token: token
                .refresh_token
                .or_else(|| refresh_token.map(str::to_string)),
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in.max(0)),
        })
    }
}

impl FeedClient for HttpSourceClient {
    async fn fetch_items(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<FeedEntry>, SourceError> {
        self.get_list("items", credentials).await
    }
}

impl GameClient for HttpSourceClient {
    async fn fetch_games(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<RemoteGame>, SourceError> {
        self.get_list("games", credentials).await
    }

    async fn fetch_achievements(
        &self,
        credentials: Option<&Credentials>,
        game_id: &str,
    ) -> Result<Vec<RemoteAchievement>, SourceError> {
        self.get_list(&format!("games/{game_id}/achievements"), credentials)
            .await
    }

    async fn fetch_achievement_metadata(
        &self,
        credentials: Option<&Credentials>,
        game_id: &str,
        api_names: &[String],
    ) -> Result<HashMap<String, AchievementMetadata>, SourceError> {
        self.post_json(
            &format!("games/{game_id}/achievements/metadata"),
            &MetadataRequest { api_names },
            credentials,
        )
        .await
    }
}

pub fn status_error(status: StatusCode, body: &[u8]) -> SourceError {
    let body = String::from_utf8_lossy(body);
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{status}")
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Auth(message),
        _ => SourceError::Transient(message),
    }
}

/// Decode each element on its own; a bad element is logged and skipped so it
/// cannot hold back the rest of the list.
pub fn decode_items<T: DeserializeOwned>(what: &str, raw: Vec<serde_json::Value>) -> Vec<T> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(err) => {
                log_warn!("skipping malformed {what} element #{index}: {err}");
                None
            }
        })
        .collect()
}

async fn decode_json_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SourceError> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
        return Err(status_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes)
        .map_err(|err| SourceError::Transient(format!("undecodable response: {err}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(token_url: Option<&str>) -> HttpSourceClient {
        HttpSourceClient::new(HttpClientConfig {
            base_url: "https://collector.example.com/steam/".into(),
            token_url: token_url.map(str::to_string),
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let client = client(None);
        assert_eq!(client.endpoint("/games"), "https://collector.example.com/steam/games");
        assert_eq!(
            client.endpoint("games/440/achievements"),
            "https://collector.example.com/steam/games/440/achievements"
        );
    }

    #[test]
    fn missing_base_url_is_rejected() {
        assert!(HttpSourceClient::new(HttpClientConfig::default()).is_err());
    }

    #[test]
    fn auth_is_required_only_with_a_token_url() {
        assert!(!client(None).requires_auth());
        assert!(client(Some("https://auth.example.com/token")).requires_auth());
        assert!(!client(Some("  ")).requires_auth());
    }

    #[test]
    fn rejected_status_maps_to_auth_error() {
        assert!(status_error(StatusCode::UNAUTHORIZED, b"").is_auth());
        assert!(status_error(StatusCode::FORBIDDEN, b"nope").is_auth());
        assert!(!status_error(StatusCode::BAD_GATEWAY, b"").is_auth());
        assert!(!status_error(StatusCode::TOO_MANY_REQUESTS, b"").is_auth());
    }

    #[test]
    fn remote_payloads_decode() {
        let games: Vec<RemoteGame> = serde_json::from_str(
            r#"[{"id":"440","name":"Game A","playtimeForeverMins":1200}]"#,
        )
        .unwrap();
        assert!(games[0].has_achievements);

        let items: Vec<FeedEntry> = serde_json::from_str(
            r#"[{"id":"a","title":"Film","occurredAt":"2024-01-02T09:00:00Z"}]"#,
        )
        .unwrap();
        assert!(items[0].occurred_at.is_some());
        assert_eq!(items[0].payload, serde_json::Value::Null);
    }

    #[test]
    fn malformed_element_does_not_sink_the_list() {
        let raw: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"id":"a","title":"First","occurredAt":"2024-01-02T09:00:00Z"},
                {"id":"b","title":"Broken","occurredAt":"yesterday"},
                {"id":"c","title":"Third","occurredAt":"2024-01-02T10:00:00Z"}
            ]"#,
        )
        .unwrap();

        let items: Vec<FeedEntry> = decode_items("items", raw);
        let ids: Vec<_> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn numeric_ids_and_integer_flags_decode() {
        let games: Vec<RemoteGame> = decode_items(
            "games",
            serde_json::from_str(r#"[{"id":440,"name":"Game A","playtimeForeverMins":5}]"#).unwrap(),
        );
        assert_eq!(games[0].id, "440");

        let achievements: Vec<RemoteAchievement> = decode_items(
            "achievements",
            serde_json::from_str(r#"[{"apiName":"WIN","achieved":1},{"apiName":"LOSE","achieved":0}]"#)
                .unwrap(),
        );
        assert!(achievements[0].achieved);
        assert!(!achievements[1].achieved);
    }
}
