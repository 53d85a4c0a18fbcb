use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    chunk::RerankedCandidate,
    context::TemplateKind,
    error::{self, Error},
    pipeline::QueryPipeline,
};

#[derive(Clone)]
pub struct ArchivistMcpServer {
    pipeline: Arc<QueryPipeline>,
    default_top_k: usize,
    tool_router: ToolRouter<Self>,
}

impl ArchivistMcpServer {
    pub fn new(pipeline: Arc<QueryPipeline>, default_top_k: usize) -> Self {
        Self {
            pipeline,
            default_top_k,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a blocking pipeline call off the async executor.
    async fn run_blocking<T, F>(&self, work: F) -> Result<T, rmcp::ErrorData>
    where
        T: Send + 'static,
        F: FnOnce(&QueryPipeline) -> error::Result<T> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || work(&pipeline))
            .await
            .map_err(|e| {
                rmcp::ErrorData::internal_error(
                    "pipeline task panicked",
                    Some(json!({ "error": e.to_string() })),
                )
            })?
            .map_err(mcp_error)
    }
}

#[tool_router(router = tool_router)]
impl ArchivistMcpServer {
    /// Answer a question from the lore archive.
    #[tool(
        name = "archivist_ask",
        description = "Answer a question about the lore. Retrieves and reranks archive passages, then generates an answer grounded in them when they are substantive."
    )]
    pub async fn archivist_ask(
        &self,
        params: Parameters<AskParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let question = params.0.question;
        let answer = self.run_blocking(move |p| p.ask(&question)).await?;

        let structured = serde_json::to_value(AskResponse {
            answer: answer.text.clone(),
            template: answer.template,
            sources: answer.sources.iter().map(SourceItem::from).collect(),
        })
        .map_err(|e| internal("failed to serialize answer", e))?;

        let mut result = CallToolResult::success(vec![Content::text(answer.text)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Retrieve archive passages without generating an answer.
    #[tool(
        name = "archivist_search",
        description = "Search the lore archive. Returns the most relevant passages after reranking, without generating an answer."
    )]
    pub async fn archivist_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let question = params.question;
        let top_k = params.top_k.unwrap_or(self.default_top_k);

        let query = question.clone();
        let results = self
            .run_blocking(move |p| p.search(&query, top_k))
            .await?;

        let items: Vec<SourceItem> = results.iter().map(SourceItem::from).collect();
        let summary = format_search_summary(&items, &question);
        let structured = serde_json::to_value(SearchResponse {
            question,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| internal("failed to serialize search results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for ArchivistMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("archivist", env!("CARGO_PKG_VERSION"))
                    .with_title("Archivist MCP"),
            )
            .with_instructions(
                "Use archivist_ask for answers about the lore and archivist_search to inspect the passages behind them.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AskParams {
    /// The question to answer.
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// The question to retrieve passages for.
    pub question: String,
    /// Number of passages to return (default: the `search_top_k` setting).
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AskResponse {
    answer: String,
    template: TemplateKind,
    sources: Vec<SourceItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    question: String,
    result_count: usize,
    results: Vec<SourceItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceItem {
    doc_id: String,
    chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<String>,
    text: String,
    relevance: f32,
    score: f32,
}

impl From<&RerankedCandidate> for SourceItem {
    fn from(c: &RerankedCandidate) -> Self {
        Self {
            doc_id: c.chunk.doc_id.clone(),
            chunk_index: c.chunk.chunk_index,
            header: c.chunk.header.clone(),
            text: c.chunk.text.clone(),
            relevance: c.relevance,
            score: c.score,
        }
    }
}

fn format_search_summary(results: &[SourceItem], question: &str) -> String {
    if results.is_empty() {
        return format!("No passages found for \"{question}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} passage{} for \"{question}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!(
            "{}:{} {:.3} {}",
            item.doc_id, item.chunk_index, item.relevance, item.text
        ));
    }

    lines.join("\n")
}

fn internal(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

fn mcp_error(error: Error) -> rmcp::ErrorData {
    if error.is_client_error() {
        return rmcp::ErrorData::invalid_params(error.root().to_string(), None);
    }
    let stage = match &error {
        Error::Pipeline { stage, .. } => Some(stage.to_string()),
        _ => None,
    };
    rmcp::ErrorData::internal_error(
        "pipeline failed".to_string(),
        Some(json!({ "error": error.to_string(), "stage": stage })),
    )
}

/// Serve the MCP tools over stdio until the client disconnects.
pub fn run_mcp(pipeline: Arc<QueryPipeline>, default_top_k: usize) -> error::Result<()> {
    let server = ArchivistMcpServer::new(pipeline, default_top_k);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}
