use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::RetryPolicy;
use crate::errors::ChatError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_CHAT_PATH: &str = "/ai-deepseek2/";
const DEFAULT_REFRESH_PATH: &str = "/token/refresh/";

/// How the prompt reaches the chat endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMethod {
    /// JSON body with `new_message` and the prior `conversation`.
    #[default]
    Post,
    /// Prompt only, as the `q` query parameter. History is not sent.
    Get,
}

impl FromStr for RequestMethod {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" => Ok(Self::Post),
            "get" => Ok(Self::Get),
            other => Err(ChatError::Config(format!(
                "unknown request method `{other}` (expected post or get)"
            ))),
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Post => "post",
            Self::Get => "get",
        })
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Client configuration for the chat endpoint and its credentials.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Base URL of the backend (scheme and host, optional prefix).
    pub base_url: String,
    /// Path of the streaming chat endpoint, relative to `base_url`.
    pub chat_path: String,
    /// Path of the token refresh endpoint, relative to `base_url`.
    pub refresh_path: String,
    pub method: RequestMethod,
    pub connect_timeout: Duration,
    /// Upper bound for a whole reply, body included. `None` lets long replies stream.
    pub request_timeout: Option<Duration>,
    /// Bounded event buffer between the reply task and its consumer.
    pub stream_buffer_capacity: usize,
    /// Refresh-and-retry attempts after a 401.
    pub auth_retries: u32,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Refuse to build a session without an access token.
    pub require_auth: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            method: RequestMethod::Post,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            stream_buffer_capacity: 128,
            auth_retries: 1,
            access_token: None,
            refresh_token: None,
            require_auth: false,
        }
    }
}

impl ChatConfig {
    /// Creates a config for the given backend with defaults for everything else.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from `PLANTCARE_*` environment variables.
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (environment, `.env` map, tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get("PLANTCARE_API_BASE_URL") {
            config.base_url = url;
        }
        if let Some(path) = get("PLANTCARE_CHAT_PATH") {
            config.chat_path = path;
        }
        if let Some(path) = get("PLANTCARE_REFRESH_PATH") {
            config.refresh_path = path;
        }
        if let Some(method) = get("PLANTCARE_CHAT_METHOD") {
            config.method = method.parse()?;
        }
        if let Some(secs) = get("PLANTCARE_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(parse_number("PLANTCARE_CONNECT_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("PLANTCARE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout =
                Some(Duration::from_secs(parse_number("PLANTCARE_REQUEST_TIMEOUT_SECS", &secs)?));
        }
        if let Some(capacity) = get("PLANTCARE_STREAM_BUFFER") {
            config.stream_buffer_capacity = parse_number("PLANTCARE_STREAM_BUFFER", &capacity)?;
        }
        if let Some(retries) = get("PLANTCARE_AUTH_RETRIES") {
            config.auth_retries = parse_number("PLANTCARE_AUTH_RETRIES", &retries)?;
        }
        config.access_token = get("PLANTCARE_ACCESS_TOKEN");
        config.refresh_token = get("PLANTCARE_REFRESH_TOKEN");
        if let Some(flag) = get("PLANTCARE_REQUIRE_AUTH") {
            config.require_auth = parse_bool(&flag).ok_or_else(|| {
                ChatError::Config(format!("PLANTCARE_REQUIRE_AUTH is not a boolean: {flag}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    pub fn method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn tokens(mut self, access: Option<String>, refresh: Option<String>) -> Self {
        self.access_token = access;
        self.refresh_token = refresh;
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Rejects values no client could work with.
    pub fn validate(&self) -> Result<(), ChatError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ChatError::Config(format!(
                "base url must start with http:// or https://: {base}"
            )));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ChatError::Config(
                "stream buffer capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.base_url, &self.chat_path)
    }

    pub fn refresh_url(&self) -> String {
        join_url(&self.base_url, &self.refresh_path)
    }

    /// Retry policy applied to 401 responses.
    pub fn auth_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.auth_retries, 250, 2.0)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        path.trim().trim_start_matches('/')
    )
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ChatError> {
    value
        .parse()
        .map_err(|_| ChatError::Config(format!("{key} is not a valid number: {value}")))
}
