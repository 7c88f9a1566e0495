// HTTP API Server module

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod copilot;
pub mod error;
mod handlers;
pub mod streaming;

use crate::auth::credential::{CredentialStore, CredentialSupplier};
use crate::auth::TokenService;
use crate::config::GatewayConfig;
use crate::proxy::policy::AccessPolicy;
use crate::proxy::router::ModelCatalog;
use crate::proxy::translator::RequestNormalizer;
use crate::proxy::usage::UsageTracker;
use copilot::CopilotClient;
use error::GatewayError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub tokens: Arc<TokenService>,
    pub usage: Arc<UsageTracker>,
    pub policy: Arc<AccessPolicy>,
    pub normalizer: Arc<RequestNormalizer>,
    pub copilot: CopilotClient,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let credentials: Arc<dyn CredentialSupplier> = Arc::new(CredentialStore::new(&config));
        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(config: Arc<GatewayConfig>, credentials: Arc<dyn CredentialSupplier>) -> Self {
        let catalog = Arc::new(ModelCatalog::new(Duration::from_secs(config.models_cache_ttl_secs)));

        Self {
            tokens: Arc::new(TokenService::new(&config.llm_api_secret, config.disable_auth)),
            usage: Arc::new(UsageTracker::new()),
            policy: Arc::new(AccessPolicy::new(catalog.clone())),
            normalizer: Arc::new(RequestNormalizer::new(
                config.default_model.clone(),
                config.default_provider.clone(),
            )),
            copilot: CopilotClient::new(config.clone(), credentials, catalog),
            config,
        }
    }
}

/// Bearer token authentication middleware
async fn auth_middleware(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.tokens.authorize(auth_header) {
        Ok(token) => {
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require a bearer token
    let protected_routes = Router::new()
        .route("/models", get(handlers::list_models))
        .route("/v1/models", get(handlers::list_models))
        .route("/completion", post(handlers::chat_completions))
        .route("/openai", post(handlers::chat_completions))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Routes that don't require authentication
    let public_routes = Router::new().route("/", get(handlers::root));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server<F>(config: Arc<GatewayConfig>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if !config.disable_auth && config.llm_api_secret.is_empty() {
        return Err(anyhow::anyhow!(
            "LLM_API_SECRET must be set unless DISABLE_AUTH is enabled"
        ));
    }
    if config.disable_auth {
        tracing::warn!("Caller authentication is disabled; every request runs as the synthetic user");
    }

    let addr = config.listen_addr();
    let app = build_router(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use tower::ServiceExt;

    const SECRET: &str = "router-test-secret";

    async fn spawn_vendor(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn sse_chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    fn fake_vendor() -> Router {
        Router::new()
            .route(
                "/models",
                get(|| async {
                    axum::Json(json!({"data": [
                        {"id": "gpt-4o", "name": "GPT-4o"},
                        {"id": "gpt-4o-mini", "name": "GPT-4o mini"}
                    ]}))
                }),
            )
            .route(
                "/chat/completions",
                post(|| async {
                    let body = format!(
                        ": keep-alive\n\n{}{}data: [DONE]\n\n",
                        sse_chunk("Hel"),
                        sse_chunk("lo")
                    );
                    ([(header::CONTENT_TYPE, "text/event-stream")], body)
                }),
            )
    }

    fn config_for(vendor: &str) -> GatewayConfig {
        let exp = chrono::Utc::now().timestamp() + 600;
        GatewayConfig {
            llm_api_secret: SECRET.to_string(),
            copilot_api_key: Some(format!("tid=t;exp={};proxy-ep={};", exp, vendor)),
            local_config_path: Some(PathBuf::from("/nonexistent/apps.json")),
            ..Default::default()
        }
    }

    fn bearer(state: &AppState) -> String {
        format!("Bearer {}", state.tokens.issue(42, "octocat").unwrap())
    }

    fn completion_request(auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_missing_authorization_is_401_with_envelope() {
        let app = build_router(AppState::new(Arc::new(config_for("http://127.0.0.1:9"))));
        let response = app
            .oneshot(completion_request(None, json!({"messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "unauthorized");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_expired_token_is_flagged() {
        let state = AppState::new(Arc::new(config_for("http://127.0.0.1:9")));
        let issued = chrono::Utc::now() - chrono::Duration::hours(2);
        let token = state.tokens.issue_at(1, "old", issued).unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[error::TOKEN_EXPIRED_HEADER], "true");
        assert_eq!(body_json(response).await["error"]["message"], "token expired");
    }

    #[tokio::test]
    async fn test_root_is_public() {
        let app = build_router(AppState::new(Arc::new(config_for("http://127.0.0.1:9"))));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_models() {
        let vendor = spawn_vendor(fake_vendor()).await;
        let state = AppState::new(Arc::new(config_for(&vendor)));
        let auth = bearer(&state);
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/models")
                    .header(header::AUTHORIZATION, auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "gpt-4o");
        assert_eq!(body["data"][0]["object"], "model");
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_aggregated_completion() {
        let vendor = spawn_vendor(fake_vendor()).await;
        let state = AppState::new(Arc::new(config_for(&vendor)));
        let auth = bearer(&state);
        let usage = state.usage.clone();
        let app = build_router(state);

        let response = app
            .oneshot(completion_request(
                Some(&auth),
                json!({"model": "gpt-4o-m", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "gpt-4o-m");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
        assert_eq!(usage.snapshot(42, "gpt-4o-mini").requests_this_minute, 1);
    }

    #[tokio::test]
    async fn test_streaming_completion_is_relayed() {
        let vendor = spawn_vendor(fake_vendor()).await;
        let state = AppState::new(Arc::new(config_for(&vendor)));
        let auth = bearer(&state);
        let app = build_router(state);

        let response = app
            .oneshot(completion_request(
                Some(&auth),
                json!({"model": "gpt-4o", "stream": true, "messages": []}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let text = String::from_utf8(body_bytes(response).await).unwrap();
        let expected = format!(
            ": keep-alive\n\n{}{}data: [DONE]\n\n",
            sse_chunk("Hel"),
            sse_chunk("lo")
        );
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429_with_retry_after() {
        let vendor = spawn_vendor(fake_vendor()).await;
        let mut config = config_for(&vendor);
        config.default_limits.max_requests_per_minute = 0;
        let state = AppState::new(Arc::new(config));
        let auth = bearer(&state);
        let app = build_router(state);

        let first = app
            .clone()
            .oneshot(completion_request(Some(&auth), json!({"model": "gpt-4o", "messages": []})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        body_bytes(first).await;

        let second = app
            .oneshot(completion_request(Some(&auth), json!({"model": "gpt-4o", "messages": []})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[header::RETRY_AFTER], "60");
        let body = body_json(second).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("requests_per_minute"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let state = AppState::new(Arc::new(config_for("http://127.0.0.1:9")));
        let auth = bearer(&state);
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/completion")
                    .header(header::AUTHORIZATION, auth)
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_restricted_country_is_403_when_enforced() {
        let vendor = spawn_vendor(fake_vendor()).await;
        let mut config = config_for(&vendor);
        config.enforce_country = true;
        let state = AppState::new(Arc::new(config));
        let auth = bearer(&state);
        let app = build_router(state);

        let mut request = completion_request(Some(&auth), json!({"model": "gpt-4o", "messages": []}));
        request
            .headers_mut()
            .insert("CF-IPCountry", "KP".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_credential_is_500() {
        let config = GatewayConfig {
            disable_auth: true,
            local_config_path: Some(PathBuf::from("/nonexistent/apps.json")),
            ..Default::default()
        };
        let app = build_router(AppState::new(Arc::new(config)));

        let response = app
            .oneshot(completion_request(None, json!({"messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "missing Copilot API key");
        assert_eq!(body["error"]["type"], "internal_error");
    }

    /// Vendor that lists only `gpt-4o` and remembers the model of every completion call
    fn recording_vendor(seen: Arc<std::sync::Mutex<Vec<String>>>) -> Router {
        Router::new()
            .route(
                "/models",
                get(|| async { axum::Json(json!({"data": [{"id": "gpt-4o", "name": "GPT-4o"}]})) }),
            )
            .route(
                "/chat/completions",
                post(move |axum::Json(body): axum::Json<Value>| {
                    let seen = seen.clone();
                    async move {
                        let model = body["model"].as_str().unwrap_or_default().to_string();
                        seen.lock().unwrap().push(model);
                        format!("{}data: [DONE]\n\n", sse_chunk("ok"))
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_request_without_model_uses_listed_default() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let vendor = spawn_vendor(recording_vendor(seen.clone())).await;
        let mut config = config_for(&vendor);
        config.disable_auth = true;
        let app = build_router(AppState::new(Arc::new(config)));

        let response = app
            .oneshot(completion_request(
                None,
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["choices"][0]["message"]["content"], "ok");
        assert_eq!(*seen.lock().unwrap(), vec!["gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn test_model_not_listed_by_vendor_is_400() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let vendor = spawn_vendor(recording_vendor(seen.clone())).await;
        let mut config = config_for(&vendor);
        config.disable_auth = true;
        let app = build_router(AppState::new(Arc::new(config)));

        let response = app
            .oneshot(completion_request(
                None,
                json!({"model": "copilot-chat", "messages": []}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_server_requires_secret() {
        let config = Arc::new(GatewayConfig::default());
        let result = start_server(config, async {}).await;
        assert!(result.is_err());
    }
}
