//! JSON-over-HTTP surface for the query pipeline.
//!
//! Pipeline calls are blocking, so each request runs on tokio's blocking pool
//! under a whole-pipeline deadline. A request that misses the deadline gets
//! `504`; the abandoned call finishes in the background and its result is
//! dropped.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json,
    Router,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::{Error, Result},
    pipeline::QueryPipeline,
};

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<QueryPipeline>,
    timeout: Duration,
    default_top_k: usize,
}

impl AppState {
    pub fn new(pipeline: Arc<QueryPipeline>, timeout: Duration, default_top_k: usize) -> Self {
        Self {
            pipeline,
            timeout,
            default_top_k,
        }
    }

    async fn run<T, F>(&self, work: F) -> std::result::Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&QueryPipeline) -> Result<T> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        let task = tokio::task::spawn_blocking(move || work(&pipeline));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "pipeline deadline exceeded");
                Err(error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("no answer within {}s", self.timeout.as_secs_f32()),
                    None,
                ))
            }
            Ok(Err(join_error)) => Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("pipeline task failed: {join_error}"),
                None,
            )),
            Ok(Ok(result)) => result.map_err(api_error),
        }
    }
}

/// Settings for [`run_server`].
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub timeout: Duration,
    pub default_top_k: usize,
    /// Allowed CORS origins; `*` allows any.
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Signed so that negative values produce a clear 400.
    pub top_k: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub chunks: Vec<ChunkBody>,
}

#[derive(Debug, Serialize)]
pub struct ChunkBody {
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ask", post(ask_handler))
        .route("/search", post(search_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(request): Json<QuestionRequest>,
) -> std::result::Result<Json<AskResponse>, ApiError> {
    let answer = state.run(move |p| p.ask(&request.question)).await?;
    tracing::info!(template = %answer.template, sources = answer.sources.len(), "answered question");
    Ok(Json(AskResponse {
        answer: answer.text,
    }))
}

async fn search_handler(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    Json(request): Json<QuestionRequest>,
) -> std::result::Result<Json<SearchResponse>, ApiError> {
    let top_k = match query.top_k {
        None => state.default_top_k,
        Some(k) if k > 0 => usize::try_from(k).unwrap_or(usize::MAX),
        Some(k) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("top_k must be greater than zero, got {k}"),
                None,
            ));
        }
    };

    let results = state
        .run(move |p| p.search(&request.question, top_k))
        .await?;
    let chunks = results
        .into_iter()
        .map(|c| ChunkBody {
            doc_id: c.chunk.doc_id,
            chunk_index: c.chunk.chunk_index,
            text: c.chunk.text,
        })
        .collect();
    Ok(Json(SearchResponse { chunks }))
}

fn error_response(status: StatusCode, message: String, stage: Option<String>) -> ApiError {
    (status, Json(ErrorBody { message, stage }))
}

/// 400 for caller mistakes, 502 when an upstream capability failed, 500 for
/// anything else, including an embedder whose vectors do not fit the index.
fn api_error(err: Error) -> ApiError {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        match err.root() {
            Error::Embedding(_) | Error::Scoring(_) | Error::Model(_) | Error::Generation(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    let stage = match &err {
        Error::Pipeline { stage, .. } => Some(stage.to_string()),
        _ => None,
    };
    if status.is_server_error() {
        tracing::error!(status = %status, "{err}");
    }
    error_response(status, err.to_string(), stage)
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return Ok(base.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o)
                .map_err(|_| Error::Config(format!("invalid CORS origin '{o}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(base.allow_origin(values))
}

/// Serve HTTP on `config.bind` until the process is stopped.
pub fn run_server(pipeline: Arc<QueryPipeline>, config: ServeConfig) -> Result<()> {
    let state = AppState::new(pipeline, config.timeout, config.default_top_k);
    let app = router(state).layer(cors_layer(&config.allow_origins)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start tokio runtime: {e}")))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        tracing::info!(addr = %config.bind, "listening");
        axum::serve(listener, app).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        generation::Generator,
        test_support::{self, CannedGenerator, FailingGenerator, ShortEmbedder, SlowGenerator},
    };

    fn app(generator: Arc<dyn Generator>, timeout: Duration) -> Router {
        router(AppState::new(test_support::pipeline(generator), timeout, 5))
    }

    fn canned() -> Router {
        app(Arc::new(CannedGenerator("A worldhopper.")), Duration::from_secs(5))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let request = axum::http::Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(canned(), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ask_returns_answer() {
        let (status, json) = send(
            canned(),
            post_json("/ask", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["answer"], "A worldhopper.");
    }

    #[tokio::test]
    async fn search_returns_ranked_chunks() {
        let (status, json) = send(
            canned(),
            post_json("/search?top_k=2", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let chunks = json["chunks"].as_array().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0]["doc_id"], "hoid");
        assert_eq!(chunks[0]["chunk_index"], 0);
        assert_eq!(chunks[1]["doc_id"], "roshar");
    }

    #[tokio::test]
    async fn search_defaults_top_k() {
        let (_, json) = send(
            canned(),
            post_json("/search", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        // Default is 5, clamped to the three indexed chunks.
        assert_eq!(json["chunks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn non_positive_top_k_is_bad_request() {
        for uri in ["/search?top_k=0", "/search?top_k=-3"] {
            let (status, json) = send(
                canned(),
                post_json(uri, serde_json::json!({ "question": "Who is Hoid?" })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(json["message"].as_str().unwrap().contains("top_k"));
        }
    }

    #[tokio::test]
    async fn blank_question_is_bad_request() {
        let (status, _) = send(
            canned(),
            post_json("/ask", serde_json::json!({ "question": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generation_failure_is_bad_gateway() {
        let (status, json) = send(
            app(Arc::new(FailingGenerator), Duration::from_secs(5)),
            post_json("/ask", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["stage"], "synthesized");
    }

    #[tokio::test]
    async fn embedder_dimension_mismatch_is_server_error() {
        let pipeline = test_support::pipeline_with(
            Arc::new(ShortEmbedder),
            Arc::new(CannedGenerator("unused")),
        );
        let app = router(AppState::new(pipeline, Duration::from_secs(5), 5));

        let (status, json) = send(
            app,
            post_json("/search", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["stage"], "searched");
    }

    #[tokio::test]
    async fn slow_pipeline_hits_deadline() {
        let (status, _) = send(
            app(Arc::new(SlowGenerator), Duration::from_millis(50)),
            post_json("/ask", serde_json::json!({ "question": "Who is Hoid?" })),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn cors_rejects_invalid_origin() {
        assert!(cors_layer(&["https://lore.example".to_string()]).is_ok());
        assert!(cors_layer(&["*".to_string()]).is_ok());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }
}
