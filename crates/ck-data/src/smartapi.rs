use crate::config::ApiCredentials;
use crate::providers::{MarketDataSource, RawCandle, Session};
use async_trait::async_trait;
use ck_types::{config_error, CkResult, FetchWindow, SourceError};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://apiconnect.angelbroking.com";

const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const CANDLE_PATH: &str = "/rest/secure/angelbroking/historical/v1/getCandleData";
const LOGOUT_PATH: &str = "/rest/secure/angelbroking/user/v1/logout";

/// Date format of the `fromdate` / `todate` parameters.
pub const API_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Error codes the API uses for an invalid or expired JWT.
const SESSION_ERROR_CODES: [&str; 3] = ["AG8001", "AG8002", "AG8003"];

/// Response envelope shared by every SmartAPI endpoint
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errorcode: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    jwt_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    feed_token: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    clientcode: &'a str,
    password: &'a str,
    totp: &'a str,
}

#[derive(Debug, Serialize)]
struct CandleRequest<'a> {
    exchange: &'a str,
    symboltoken: &'a str,
    interval: &'a str,
    fromdate: String,
    todate: String,
}

#[derive(Debug, Serialize)]
struct LogoutRequest<'a> {
    clientcode: &'a str,
}

/// Which endpoint family a call belongs to; decides how a 401 is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Login,
    Secure,
}

/// Angel One SmartAPI historical-candle client
#[derive(Debug)]
pub struct SmartApiSource {
    pub name: String,
    base_url: String,
    credentials: ApiCredentials,
    client: reqwest::Client,
}

impl SmartApiSource {
    pub fn new(credentials: ApiCredentials) -> CkResult<Self> {
        let base_url = if credentials.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            credentials.base_url.trim_end_matches('/').to_string()
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| config_error!("cannot build HTTP client: {}", e))?;

        Ok(Self {
            name: "SmartAPI".to_string(),
            base_url,
            credentials,
            client,
        })
    }

    async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
        phase: Phase,
    ) -> Result<Option<T>, SourceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("X-PrivateKey", &self.credentials.api_key)
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| SourceError::Network {
            message: format!("HTTP request failed: {}", e),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| SourceError::Network {
            message: format!("failed to read response body: {}", e),
        })?;

        if let Some(error) = classify_status(status, &text, phase) {
            return Err(error);
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&text).map_err(|e| SourceError::Decode {
            message: format!("{} (body: {})", e, truncate(&text, 200)),
        })?;

        if envelope.status {
            Ok(envelope.data)
        } else {
            Err(classify_envelope(
                envelope.errorcode.as_deref(),
                envelope.message.as_deref().unwrap_or("unknown error"),
                phase,
            ))
        }
    }
}

#[async_trait]
impl MarketDataSource for SmartApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) -> CkResult<Session> {
        if !self.credentials.is_complete() {
            return Err(SourceError::Auth {
                message: "API key, client code, password and TOTP are all required".to_string(),
            }
            .into());
        }

        let body = LoginRequest {
            clientcode: &self.credentials.client_code,
            password: &self.credentials.password,
            totp: &self.credentials.totp,
        };
        let data: Option<LoginData> = self.post(LOGIN_PATH, &body, None, Phase::Login).await?;
        let data = data.ok_or_else(|| SourceError::Auth {
            message: "login response carried no tokens".to_string(),
        })?;

        tracing::info!("Authenticated with SmartAPI as {}", self.credentials.client_code);
        Ok(Session::new(&data.jwt_token, &data.refresh_token, &data.feed_token))
    }

    async fn get_candles(
        &self,
        session: &Session,
        window: &FetchWindow,
    ) -> CkResult<Vec<RawCandle>> {
        let body = CandleRequest {
            exchange: &window.exchange,
            symboltoken: &window.symbol_token,
            interval: window.granularity.api_name(),
            fromdate: window.start.format(API_DATE_FORMAT).to_string(),
            todate: window.end.format(API_DATE_FORMAT).to_string(),
        };

        tracing::debug!("Requesting candles for {}", window);
        let rows: Option<Vec<serde_json::Value>> = self
            .post(CANDLE_PATH, &body, Some(&session.jwt_token), Phase::Secure)
            .await?;

        Ok(rows
            .unwrap_or_default()
            .iter()
            .map(RawCandle::from_json_row)
            .collect())
    }

    async fn logout(&self, session: &Session) -> CkResult<()> {
        let body = LogoutRequest {
            clientcode: &self.credentials.client_code,
        };
        let _: Option<serde_json::Value> = self
            .post(LOGOUT_PATH, &body, Some(&session.jwt_token), Phase::Secure)
            .await?;
        tracing::debug!("Logged out of SmartAPI");
        Ok(())
    }
}

fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("exceeding access rate") || lower.contains("too many requests")
}

fn unauthorized(phase: Phase, message: String) -> SourceError {
    match phase {
        Phase::Login => SourceError::Auth { message },
        Phase::Secure => SourceError::SessionExpired { message },
    }
}

/// Transport-level classification, before the body is decoded.
fn classify_status(status: StatusCode, body: &str, phase: Phase) -> Option<SourceError> {
    let detail = || format!("HTTP {}: {}", status, truncate(body, 200));

    if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limit_text(body) {
        return Some(SourceError::RateLimited { message: detail() });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(unauthorized(phase, detail()));
    }
    if status.is_server_error() {
        return Some(SourceError::Network { message: detail() });
    }
    if !status.is_success() {
        return Some(SourceError::Api {
            code: None,
            message: detail(),
        });
    }
    None
}

/// Classification of a decoded `status: false` envelope.
fn classify_envelope(code: Option<&str>, message: &str, phase: Phase) -> SourceError {
    let code = code.filter(|c| !c.is_empty());
    let session_problem = code.is_some_and(|c| SESSION_ERROR_CODES.contains(&c))
        || message.eq_ignore_ascii_case("token expired")
        || message.to_lowercase().contains("invalid token");

    if session_problem {
        return unauthorized(phase, message.to_string());
    }
    if is_rate_limit_text(message) {
        return SourceError::RateLimited {
            message: message.to_string(),
        };
    }
    match phase {
        Phase::Login => SourceError::Auth {
            message: format!("{}{}", message, code.map(|c| format!(" ({c})")).unwrap_or_default()),
        },
        Phase::Secure => SourceError::Api {
            code: code.map(str::to_string),
            message: message.to_string(),
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
