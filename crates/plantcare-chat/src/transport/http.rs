use std::sync::Arc;

use futures::StreamExt as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::auth::{CredentialProvider, RetryPolicy};
use crate::config::{ChatConfig, RequestMethod};
use crate::errors::{ChatError, TransportError};

use super::{ByteStream, ChatRequest, ChatTransport, ResponseMeta, ResponseStream};

/// Streaming chat transport over HTTP (reqwest, rustls).
pub struct HttpChatTransport {
    client: reqwest::Client,
    chat_url: String,
    method: RequestMethod,
    request_timeout: Option<std::time::Duration>,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
}

impl HttpChatTransport {
    pub fn new(
        config: &ChatConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ChatError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build chat client: {e}")))?;
        Ok(Self {
            client,
            chat_url: config.chat_url(),
            method: config.method,
            request_timeout: config.request_timeout,
            credentials,
            retry: config.auth_retry_policy(),
        })
    }

    /// Overrides the 401 refresh-and-retry policy taken from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, request: &ChatRequest, token: Option<&str>) -> reqwest::RequestBuilder {
        let mut http_req = match self.method {
            RequestMethod::Post => self.client.post(&self.chat_url).json(request),
            RequestMethod::Get => self
                .client
                .get(&self.chat_url)
                .query(&[("q", request.new_message.as_str())]),
        };
        http_req = http_req.header(ACCEPT, "text/plain, */*");
        if let Some(token) = token {
            http_req = http_req.bearer_auth(token);
        }
        if let Some(timeout) = self.request_timeout {
            http_req = http_req.timeout(timeout);
        }
        http_req
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(&self, request: ChatRequest) -> Result<ResponseStream, TransportError> {
        let mut token = self
            .credentials
            .access_token()
            .await
            .map_err(|e| TransportError::request(format!("credentials unavailable: {e}")))?;
        let mut retries = 0_u32;

        loop {
            debug!(submission_id = %request.submission_id, method = %self.method, retries, "opening chat stream");
            let response = self
                .build_request(&request, token.as_deref())
                .send()
                .await
                .map_err(|e| TransportError::request(e.to_string()))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if !self.retry.can_retry(retries) {
                    return Err(TransportError::Unauthorized {
                        message: error_body(response).await,
                    });
                }
                match self.credentials.refresh(token.as_deref()).await {
                    Ok(fresh) => token = Some(fresh),
                    Err(err) => {
                        warn!(submission_id = %request.submission_id, error = %err, "token refresh failed after 401");
                        return Err(TransportError::Unauthorized {
                            message: err.to_string(),
                        });
                    }
                }
                tokio::time::sleep(self.retry.backoff_duration(retries)).await;
                retries += 1;
                continue;
            }

            if !status.is_success() {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: error_body(response).await,
                });
            }

            let meta = ResponseMeta {
                status: status.as_u16(),
                content_type: response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            };
            let body: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| TransportError::read(e.to_string()))),
            );
            return Ok(ResponseStream { body, meta });
        }
    }
}

async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::{Anonymous, RefreshingCredentials, TokenStore};
    use crate::test_support::{Reply, ScriptedServer};

    async fn collect(mut body: ByteStream) -> (Vec<u8>, Option<TransportError>) {
        let mut out = Vec::new();
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(err) => return (out, Some(err)),
            }
        }
        (out, None)
    }

    fn anonymous(config: &ChatConfig) -> HttpChatTransport {
        HttpChatTransport::new(config, Arc::new(Anonymous)).expect("transport")
    }

    async fn open_err(transport: &HttpChatTransport, request: ChatRequest) -> TransportError {
        match transport.open_stream(request).await {
            Ok(_) => panic!("open_stream should fail"),
            Err(err) => err,
        }
    }

    #[tokio::test]
    async fn post_streams_chunked_body_in_order() {
        let server =
            ScriptedServer::start(vec![Reply::chunked(&["Hi ", "```json\n[]\n```", " bye"])]).await;
        let transport = anonymous(&ChatConfig::new(server.url.clone()));

        let response = transport
            .open_stream(ChatRequest::new("ferns?", Vec::new()))
            .await
            .expect("open");
        assert_eq!(response.meta.status, 200);
        let (bytes, err) = collect(response.body).await;
        assert!(err.is_none());
        assert_eq!(bytes, b"Hi ```json\n[]\n``` bye");

        let requests = server.requests().await;
        assert!(requests[0].starts_with("POST /ai-deepseek2/ "));
        assert!(requests[0].contains(r#""new_message":"ferns?""#));
        assert!(!requests[0].to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn get_mode_sends_prompt_as_query() {
        let server = ScriptedServer::start(vec![Reply::chunked(&["ok"])]).await;
        let config = ChatConfig::new(server.url.clone()).method(RequestMethod::Get);
        let transport = anonymous(&config);

        let response = transport
            .open_stream(ChatRequest::new("shade plants", Vec::new()))
            .await
            .expect("open");
        let (bytes, _) = collect(response.body).await;
        assert_eq!(bytes, b"ok");
        assert!(server.requests().await[0].starts_with("GET /ai-deepseek2/?q=shade+plants "));
    }

    #[tokio::test]
    async fn non_success_status_fails_before_any_body() {
        let server = ScriptedServer::start(vec![Reply::text(500, "boom")]).await;
        let transport = anonymous(&ChatConfig::new(server.url.clone()));

        let err = open_err(&transport, ChatRequest::new("hi", Vec::new())).await;
        assert_eq!(
            err,
            TransportError::Status {
                status: 500,
                body: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn unauthorized_refreshes_token_and_retries() {
        let server = ScriptedServer::start(vec![
            Reply::json(401, r#"{"detail":"token expired"}"#),
            Reply::json(200, r#"{"access":"fresh"}"#),
            Reply::chunked(&["hello"]),
        ])
        .await;
        let config = ChatConfig::new(server.url.clone());
        let credentials = RefreshingCredentials::new(
            Arc::new(TokenStore::new(Some("stale".into()), Some("r".into()))),
            config.refresh_url(),
            Duration::from_secs(5),
        )
        .expect("credentials");
        let transport = HttpChatTransport::new(&config, Arc::new(credentials))
            .expect("transport")
            .with_retry_policy(RetryPolicy::exponential(1, 1, 2.0));

        let response = transport
            .open_stream(ChatRequest::new("hi", Vec::new()))
            .await
            .expect("open after refresh");
        let (bytes, _) = collect(response.body).await;
        assert_eq!(bytes, b"hello");

        let requests: Vec<String> = server
            .requests()
            .await
            .into_iter()
            .map(|r| r.to_ascii_lowercase())
            .collect();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].contains("authorization: bearer stale"));
        assert!(requests[1].starts_with("post /token/refresh/ "));
        assert!(requests[2].contains("authorization: bearer fresh"));
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_is_terminal() {
        let server = ScriptedServer::start(vec![Reply::json(401, "{}")]).await;
        let transport = anonymous(&ChatConfig::new(server.url.clone()));

        let err = open_err(&transport, ChatRequest::new("hi", Vec::new())).await;
        assert!(matches!(err, TransportError::Unauthorized { .. }));
        assert_eq!(err.status_code(), Some(401));
    }

    #[tokio::test]
    async fn dropped_connection_mid_body_is_read_error() {
        let server = ScriptedServer::start(vec![Reply::Truncated {
            chunks: vec![b"partial intro".to_vec()],
        }])
        .await;
        let transport = anonymous(&ChatConfig::new(server.url.clone()));

        let response = transport
            .open_stream(ChatRequest::new("hi", Vec::new()))
            .await
            .expect("open");
        let (bytes, err) = collect(response.body).await;
        assert_eq!(bytes, b"partial intro");
        assert!(matches!(err, Some(TransportError::Read { .. })));
    }

    #[tokio::test]
    async fn connection_refused_is_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);
        let transport = anonymous(&ChatConfig::new(url));

        let err = open_err(&transport, ChatRequest::new("hi", Vec::new())).await;
        assert!(matches!(err, TransportError::Request { .. }));
    }
}
