//! Inference transport: one chat-completion request per call, every outcome
//! classified.
//!
//! There is no generic retry loop — sampling is deterministic (fixed seed,
//! temperature 0), so retrying a successfully answered or definitively failed
//! request is pointless. The single exception is a refused connection, which
//! usually means a model is still loading: the client retries exactly once
//! after a fixed delay. An owned consecutive-refusal counter (not a global)
//! marks the client "down" after three, letting the orchestrator pause for
//! operator intervention instead of spinning; it is reset only through
//! [`InferenceClient::reset_health`].

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ccbench_shared::{CcbenchError, EndpointConfig, Engine, InferenceParams, Result};

/// User-Agent string for endpoint requests.
const USER_AGENT: &str = concat!("ccbench/", env!("CARGO_PKG_VERSION"));

/// Timeout for the health and model-listing probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Classification of a single inference request. Exactly one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    /// The model produced text.
    Success { text: String, output_tokens: u64 },
    /// The endpoint answered with a non-success HTTP status.
    HttpError(u16),
    /// The per-request hard timeout fired. Distinct from cancellation.
    Timeout,
    /// The TCP connection was refused (endpoint not accepting connections).
    ConnectionRefused,
    /// A well-formed response with no usable text.
    EmptyResponse,
    /// The response body did not match the expected shape.
    MalformedResponse,
}

impl InferenceOutcome {
    /// Error code recorded in the result row, `None` for success.
    pub fn error_code(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::HttpError(status) => Some(format!("HTTP_{status}")),
            Self::Timeout => Some("TIMEOUT".into()),
            Self::ConnectionRefused => Some("CONNECTION_REFUSED".into()),
            Self::EmptyResponse => Some("EMPTY_RESPONSE".into()),
            Self::MalformedResponse => Some("MALFORMED_RESPONSE".into()),
        }
    }
}

/// A classified outcome plus how long the request took to resolve.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub outcome: InferenceOutcome,
    pub elapsed: Duration,
}

/// Whether a send resolved or was abandoned by cancellation. A row is only
/// ever written for a resolved request — never for an abandoned one.
#[derive(Debug)]
pub enum SendOutcome {
    Completed(InferenceResult),
    Cancelled,
}

/// One request's worth of inputs, borrowed from the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub params: &'a InferenceParams,
    /// Per-request context-window hint, already capped at the model maximum.
    pub num_ctx: u64,
}

// ---------------------------------------------------------------------------
// Connection health
// ---------------------------------------------------------------------------

/// Owned consecutive-refusal tracker. Any resolved non-refused outcome
/// clears the streak; once the down threshold is reached the orchestrator
/// stops sending, so only [`reset`](Self::reset) (operator-triggered)
/// recovers from the down state.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    consecutive_refusals: u32,
}

impl ConnectionHealth {
    const DOWN_THRESHOLD: u32 = 3;

    fn record(&mut self, outcome: &InferenceOutcome) {
        if matches!(outcome, InferenceOutcome::ConnectionRefused) {
            self.consecutive_refusals += 1;
        } else {
            self.consecutive_refusals = 0;
        }
    }

    pub fn is_down(&self) -> bool {
        self.consecutive_refusals >= Self::DOWN_THRESHOLD
    }

    pub fn reset(&mut self) {
        self.consecutive_refusals = 0;
    }
}

// ---------------------------------------------------------------------------
// InferenceClient
// ---------------------------------------------------------------------------

/// HTTP client for a local inference endpoint (ollama or llama-server).
pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: EndpointConfig,
    health: ConnectionHealth,
}

impl InferenceClient {
    pub fn new(endpoint: EndpointConfig) -> Result<InferenceClient> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CcbenchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(InferenceClient {
            http,
            endpoint,
            health: ConnectionHealth::default(),
        })
    }

    /// Whether the consecutive-refusal threshold has been crossed.
    pub fn is_down(&self) -> bool {
        self.health.is_down()
    }

    /// Operator-triggered recovery after intervention.
    pub fn reset_health(&mut self) {
        self.health.reset();
    }

    /// Send one request and classify the outcome.
    ///
    /// Explicit two-state retry policy: attempt, then on `ConnectionRefused`
    /// — and only on it — delay once and attempt once more. Every other
    /// outcome, including a timeout during the retried attempt, is final.
    pub async fn send(
        &mut self,
        request: &InferenceRequest<'_>,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let Some(first) = self.attempt(request, cancel).await else {
            return SendOutcome::Cancelled;
        };
        self.health.record(&first.outcome);

        if !matches!(first.outcome, InferenceOutcome::ConnectionRefused) {
            return SendOutcome::Completed(first);
        }

        let delay = Duration::from_secs(self.endpoint.retry_delay_secs);
        warn!(
            model = request.model,
            delay_secs = delay.as_secs(),
            "connection refused, retrying once after delay"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SendOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(second) = self.attempt(request, cancel).await else {
            return SendOutcome::Cancelled;
        };
        self.health.record(&second.outcome);
        SendOutcome::Completed(second)
    }

    /// One dispatch, raced against cancellation. `None` means the in-flight
    /// request was abandoned.
    async fn attempt(
        &self,
        request: &InferenceRequest<'_>,
        cancel: &CancellationToken,
    ) -> Option<InferenceResult> {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = self.dispatch(request) => outcome,
        };

        let elapsed = started.elapsed();
        debug!(
            model = request.model,
            elapsed_ms = elapsed.as_millis(),
            outcome = ?outcome.error_code(),
            "inference request resolved"
        );

        Some(InferenceResult { outcome, elapsed })
    }

    async fn dispatch(&self, request: &InferenceRequest<'_>) -> InferenceOutcome {
        match self.endpoint.engine {
            Engine::Ollama => self.dispatch_ollama(request).await,
            Engine::LlamaServer => self.dispatch_openai(request).await,
        }
    }

    /// Ollama native API: `POST /api/chat` with an `options` block carrying
    /// the sampling parameters and the per-request `num_ctx` hint.
    async fn dispatch_ollama(&self, request: &InferenceRequest<'_>) -> InferenceOutcome {
        let p = request.params;
        let body = json!({
            "model": request.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "options": {
                "num_ctx": request.num_ctx,
                "temperature": p.temperature,
                "seed": p.seed,
                "top_p": p.top_p,
                "top_k": p.top_k,
                "repeat_penalty": p.repeat_penalty,
                "num_predict": p.num_predict,
            },
        });

        let response = match self
            .http
            .post(format!("{}/api/chat", self.endpoint.base_url))
            .timeout(self.request_timeout())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        if !status.is_success() {
            return InferenceOutcome::HttpError(status.as_u16());
        }

        let parsed: OllamaChatResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) if e.is_timeout() => return InferenceOutcome::Timeout,
            Err(_) => return InferenceOutcome::MalformedResponse,
        };

        let text = parsed.message.map(|m| m.content).unwrap_or_default();
        if text.trim().is_empty() {
            return InferenceOutcome::EmptyResponse;
        }

        InferenceOutcome::Success {
            text,
            output_tokens: parsed.eval_count.unwrap_or(0),
        }
    }

    /// llama-server speaks the OpenAI-compatible chat-completions shape.
    /// Its context window is fixed at server startup, so the computed hint
    /// only bounds `max_tokens` here.
    async fn dispatch_openai(&self, request: &InferenceRequest<'_>) -> InferenceOutcome {
        let p = request.params;
        debug!(num_ctx = request.num_ctx, "llama-server context is fixed server-side");
        let body = json!({
            "model": request.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": p.temperature,
            "seed": p.seed,
            "top_p": p.top_p,
            // llama-server extensions to the OpenAI shape.
            "top_k": p.top_k,
            "repeat_penalty": p.repeat_penalty,
            "max_tokens": p.num_predict.min(request.num_ctx),
        });

        let response = match self
            .http
            .post(format!("{}/v1/chat/completions", self.endpoint.base_url))
            .timeout(self.request_timeout())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        if !status.is_success() {
            return InferenceOutcome::HttpError(status.as_u16());
        }

        let parsed: OpenAiChatResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) if e.is_timeout() => return InferenceOutcome::Timeout,
            Err(_) => return InferenceOutcome::MalformedResponse,
        };

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return InferenceOutcome::EmptyResponse;
        }

        InferenceOutcome::Success {
            text,
            output_tokens: parsed
                .usage
                .and_then(|u| u.completion_tokens)
                .unwrap_or(0),
        }
    }

    // -- probes ---------------------------------------------------------

    /// Cheap health probe. Best-effort: any failure reads as "not healthy",
    /// never as an error.
    pub async fn health_check(&self) -> bool {
        let url = match self.endpoint.engine {
            Engine::Ollama => format!("{}/api/tags", self.endpoint.base_url),
            Engine::LlamaServer => format!("{}/health", self.endpoint.base_url),
        };

        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Models the endpoint reports as available. Best-effort: `None` when
    /// the probe fails, which callers treat as "unknown", not "none".
    pub async fn list_models(&self) -> Option<Vec<String>> {
        match self.endpoint.engine {
            Engine::Ollama => {
                let url = format!("{}/api/tags", self.endpoint.base_url);
                let response = self.http.get(&url).timeout(PROBE_TIMEOUT).send().await.ok()?;
                let parsed: OllamaTagsResponse = response.json().await.ok()?;
                Some(parsed.models.into_iter().map(|m| m.name).collect())
            }
            Engine::LlamaServer => {
                let url = format!("{}/v1/models", self.endpoint.base_url);
                let response = self.http.get(&url).timeout(PROBE_TIMEOUT).send().await.ok()?;
                let parsed: OpenAiModelsResponse = response.json().await.ok()?;
                Some(parsed.data.into_iter().map(|m| m.id).collect())
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.request_timeout_secs)
    }
}

/// Map a reqwest transport error into the taxonomy. DNS failures land on
/// `ConnectionRefused` too; for a localhost endpoint the distinction is moot.
fn classify_transport_error(e: &reqwest::Error) -> InferenceOutcome {
    if e.is_timeout() {
        InferenceOutcome::Timeout
    } else if e.is_connect() {
        InferenceOutcome::ConnectionRefused
    } else {
        InferenceOutcome::MalformedResponse
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
}

#[derive(Deserialize)]
struct OpenAiModelsResponse {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    completion_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PARAMS: InferenceParams = InferenceParams {
        temperature: 0.0,
        seed: 42,
        top_p: 0.9,
        top_k: 40,
        repeat_penalty: 1.1,
        num_predict: 2048,
        token_overhead: 512,
    };

    fn endpoint(base_url: String, engine: Engine) -> EndpointConfig {
        EndpointConfig {
            base_url,
            engine,
            request_timeout_secs: 2,
            retry_delay_secs: 0,
            warmup_prompts: 0,
        }
    }

    fn request<'a>() -> InferenceRequest<'a> {
        InferenceRequest {
            model: "test-model",
            system: "system prompt",
            user: "user message",
            params: &PARAMS,
            num_ctx: 4096,
        }
    }

    async fn send_once(client: &mut InferenceClient) -> InferenceResult {
        match client.send(&request(), &CancellationToken::new()).await {
            SendOutcome::Completed(result) => result,
            SendOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn ollama_success_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-model",
                "message": {"role": "assistant", "content": "The answer is 42."},
                "done": true,
                "eval_count": 17
            })))
            .mount(&server)
            .await;

        let mut client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        let result = send_once(&mut client).await;

        match result.outcome {
            InferenceOutcome::Success {
                text,
                output_tokens,
            } => {
                assert_eq!(text, "The answer is 42.");
                assert_eq!(output_tokens, 17);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(!client.is_down());
    }

    #[tokio::test]
    async fn llama_server_success_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Answer."}}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 9}
            })))
            .mount(&server)
            .await;

        let mut client =
            InferenceClient::new(endpoint(server.uri(), Engine::LlamaServer)).unwrap();
        let result = send_once(&mut client).await;

        assert_eq!(
            result.outcome,
            InferenceOutcome::Success {
                text: "Answer.".into(),
                output_tokens: 9
            }
        );
    }

    #[tokio::test]
    async fn http_status_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::HttpError(500));
        assert_eq!(result.outcome.error_code(), Some("HTTP_500".into()));
    }

    #[tokio::test]
    async fn empty_response_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "   "},
                "done": true
            })))
            .mount(&server)
            .await;

        let mut client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::EmptyResponse);
    }

    #[tokio::test]
    async fn malformed_response_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
            .mount(&server)
            .await;

        let mut client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::MalformedResponse);
    }

    #[tokio::test]
    async fn timeout_classified_distinctly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({"message": {"content": "late"}})),
            )
            .mount(&server)
            .await;

        let mut endpoint = endpoint(server.uri(), Engine::Ollama);
        endpoint.request_timeout_secs = 1;
        let mut client = InferenceClient::new(endpoint).unwrap();
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::Timeout);
        // A timeout is not a connection failure.
        assert!(!client.is_down());
    }

    /// Bind-then-drop a listener to get a port that refuses connections.
    fn refused_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn connection_refused_retries_once_then_reports_down() {
        let mut client =
            InferenceClient::new(endpoint(refused_port_url(), Engine::Ollama)).unwrap();

        // One send = initial attempt + one delayed retry = 2 refusals.
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::ConnectionRefused);
        assert!(!client.is_down());

        // The next send crosses the 3-refusal threshold.
        let result = send_once(&mut client).await;
        assert_eq!(result.outcome, InferenceOutcome::ConnectionRefused);
        assert!(client.is_down());

        client.reset_health();
        assert!(!client.is_down());
    }

    #[tokio::test]
    async fn success_clears_refusal_streak() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "ok"},
                "eval_count": 1
            })))
            .mount(&server)
            .await;

        let mut client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        client.health.record(&InferenceOutcome::ConnectionRefused);
        client.health.record(&InferenceOutcome::ConnectionRefused);

        let result = send_once(&mut client).await;
        assert!(matches!(result.outcome, InferenceOutcome::Success { .. }));
        assert!(!client.is_down());
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_is_abandoned() {
        let mut client =
            InferenceClient::new(endpoint("http://127.0.0.1:1".into(), Engine::Ollama)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        match client.send(&request(), &cancel).await {
            SendOutcome::Cancelled => {}
            SendOutcome::Completed(r) => panic!("expected cancellation, got {:?}", r.outcome),
        }
    }

    #[tokio::test]
    async fn probes_are_best_effort() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "qwen2.5:14b-instruct"}, {"name": "llama3.1:8b"}]
            })))
            .mount(&server)
            .await;

        let client = InferenceClient::new(endpoint(server.uri(), Engine::Ollama)).unwrap();
        assert!(client.health_check().await);
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["qwen2.5:14b-instruct", "llama3.1:8b"]);

        let dead = InferenceClient::new(endpoint(refused_port_url(), Engine::Ollama)).unwrap();
        assert!(!dead.health_check().await);
        assert!(dead.list_models().await.is_none());
    }
}
