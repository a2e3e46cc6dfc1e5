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
    chapter_store::Chapter,
    error::{self, Error},
    search::{ChapterMatch, ChapterSearch, DEFAULT_TOP_K, Question, QuestionMapping},
    textbook_id::TextbookId,
};

#[derive(Clone)]
pub struct ChapterIndexMcpServer {
    state: Arc<ChapterSearch>,
    tool_router: ToolRouter<Self>,
}

impl ChapterIndexMcpServer {
    fn new(state: ChapterSearch) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }

    /// Run `f` on the blocking pool; embedding and disk I/O are synchronous.
    async fn blocking<T, F>(&self, f: F) -> Result<T, rmcp::ErrorData>
    where
        F: FnOnce(&ChapterSearch) -> error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|e| mcp_error("worker task failed", e))?
            .map_err(tool_error)
    }
}

#[tool_router(router = tool_router)]
impl ChapterIndexMcpServer {
    /// Find the chapters of a textbook closest to a query.
    #[tool(
        name = "chapter_search",
        description = "Find the chapters of an indexed textbook that best match a query. Returns chapters with similarity scores (0-100)."
    )]
    pub async fn chapter_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let id = parse_id(&params.textbook_id)?;
        let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K);
        let query = params.query;

        let (query, matches) = self
            .blocking(move |search| {
                let matches = search.search_chapters(&id, &query, top_k)?;
                Ok((query, matches))
            })
            .await?;

        let summary = format_search_summary(&matches, &query);
        let structured = serde_json::to_value(SearchResponse {
            textbook_id: params.textbook_id,
            query,
            result_count: matches.len(),
            results: matches,
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Map each question to its closest chapters.
    #[tool(
        name = "chapter_map_questions",
        description = "Map a list of questions ({id, text}) to the closest chapters of an indexed textbook. Output order matches input order."
    )]
    pub async fn chapter_map_questions(
        &self,
        params: Parameters<MapParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let id = parse_id(&params.textbook_id)?;
        let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K);
        let questions = params.questions;

        let mappings = self
            .blocking(move |search| {
                search.map_questions_to_chapters(&id, &questions, top_k)
            })
            .await?;

        let summary = format_mapping_summary(&mappings);
        let structured = serde_json::to_value(MapResponse {
            textbook_id: params.textbook_id,
            question_count: mappings.len(),
            mappings,
        })
        .map_err(|e| mcp_error("failed to serialize question mappings", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Build or replace the index of a textbook.
    #[tool(
        name = "chapter_index_build",
        description = "Build or rebuild the chapter index of a textbook from its chapters. The previous index stays live until the new one is complete."
    )]
    pub async fn chapter_index_build(
        &self,
        params: Parameters<BuildParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let id = parse_id(&params.textbook_id)?;
        let chapters = params.chapters;

        let summary = self
            .blocking(move |search| search.build(&id, &chapters))
            .await?;

        let text = format!(
            "Indexed {} chapters of textbook '{}' ({} dimensions, {})",
            summary.chapter_count,
            summary.textbook_id,
            summary.dimension,
            summary.generation
        );
        let structured = serde_json::to_value(&summary)
            .map_err(|e| mcp_error("failed to serialize build summary", e))?;

        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Report the on-disk state of a textbook index.
    #[tool(
        name = "chapter_index_health",
        description = "Check whether a textbook index exists and is consistent (vector count, chapter count, dimension)."
    )]
    pub async fn chapter_index_health(
        &self,
        params: Parameters<TextbookParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let id = parse_id(&params.0.textbook_id)?;
        let report = self
            .blocking(move |search| Ok(search.manager().health_check(&id)))
            .await?;

        let text = match &report.problem {
            None => format!(
                "Textbook '{}' is healthy: {} chapters",
                report.textbook_id, report.chapter_count
            ),
            Some(problem) => {
                format!("Textbook '{}' is unhealthy: {problem}", report.textbook_id)
            }
        };
        let structured = serde_json::to_value(&report)
            .map_err(|e| mcp_error("failed to serialize health report", e))?;

        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Remove a textbook index.
    #[tool(
        name = "chapter_index_delete",
        description = "Delete the chapter index of a textbook. Deleting a missing index is not an error."
    )]
    pub async fn chapter_index_delete(
        &self,
        params: Parameters<TextbookParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let textbook_id = params.0.textbook_id;
        let id = parse_id(&textbook_id)?;
        let removed = self.blocking(move |search| search.delete(&id)).await?;

        let text = if removed {
            format!("Deleted index for textbook '{textbook_id}'")
        } else {
            format!("No index for textbook '{textbook_id}'")
        };

        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.structured_content = Some(json!({
                "textbookId": textbook_id,
                "removed": removed,
            }));
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for ChapterIndexMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("chapterindex", env!("CARGO_PKG_VERSION"))
                    .with_title("chapterindex MCP"),
            )
            .with_instructions(
                "Use chapter_search to find chapters for one query and chapter_map_questions for a batch of questions. Build an index with chapter_index_build first.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Textbook identifier.
    pub textbook_id: String,
    /// Query text.
    pub query: String,
    /// Number of chapters to return (default: 3).
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MapParams {
    /// Textbook identifier.
    pub textbook_id: String,
    /// Questions to map; ids are echoed back unchanged.
    pub questions: Vec<Question>,
    /// Number of chapters per question (default: 3).
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildParams {
    /// Textbook identifier.
    pub textbook_id: String,
    /// Chapters in reading order.
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TextbookParams {
    /// Textbook identifier.
    pub textbook_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    textbook_id: String,
    query: String,
    result_count: usize,
    results: Vec<ChapterMatch>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MapResponse {
    textbook_id: String,
    question_count: usize,
    mappings: Vec<QuestionMapping>,
}

fn format_search_summary(matches: &[ChapterMatch], query: &str) -> String {
    if matches.is_empty() {
        return format!("No chapters found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(matches.len() + 1);
    let suffix = if matches.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} chapter{} for \"{query}\":",
        matches.len(),
        suffix
    ));
    for m in matches {
        lines.push(format_match_line(m));
    }

    lines.join("\n")
}

fn format_mapping_summary(mappings: &[QuestionMapping]) -> String {
    if mappings.is_empty() {
        return "No questions to map".to_string();
    }

    let mut lines = Vec::new();
    for mapping in mappings {
        lines.push(format!("Question {}:", mapping.question_id));
        for m in &mapping.chapters {
            lines.push(format!("  {}", format_match_line(m)));
        }
    }
    lines.join("\n")
}

fn format_match_line(m: &ChapterMatch) -> String {
    format!(
        "{}. Chapter {}: {} ({}) {:.1} {}",
        m.rank,
        m.chapter.number,
        m.chapter.title,
        m.page_range(),
        m.similarity_score,
        m.relevance().label()
    )
}

fn parse_id(raw: &str) -> Result<TextbookId, rmcp::ErrorData> {
    TextbookId::new(raw).map_err(tool_error)
}

/// Caller mistakes become `invalid_params`; everything else is internal.
fn tool_error(error: Error) -> rmcp::ErrorData {
    let data = Some(json!({
        "error": error.to_string(),
        "needsReindex": error.needs_reindex(),
    }));
    match error {
        Error::InvalidTopK
        | Error::InvalidTextbookId(_)
        | Error::InvalidChapter { .. }
        | Error::EmptyInput
        | Error::IndexNotFound(_)
        | Error::RebuildInProgress(_) => {
            rmcp::ErrorData::invalid_params(error.to_string(), data)
        }
        _ => rmcp::ErrorData::internal_error(error.to_string(), data),
    }
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(search: ChapterSearch) -> error::Result<()> {
    let server = ChapterIndexMcpServer::new(search);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_dir::DataDir,
        index_manager::IndexManager,
        trigram::TrigramEmbedder,
    };

    fn server() -> (tempfile::TempDir, ChapterIndexMcpServer) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let manager = Arc::new(IndexManager::open(data_dir).unwrap());
        let search =
            ChapterSearch::new(manager, Arc::new(TrigramEmbedder::default()));
        (tmp, ChapterIndexMcpServer::new(search))
    }

    fn chapters() -> Vec<Chapter> {
        vec![
            Chapter {
                number: Some(1),
                title: "Cell Biology".to_string(),
                page_start: 1,
                page_end: 30,
                content: "Cells, membranes, organelles and the nucleus."
                    .to_string(),
            },
            Chapter {
                number: Some(2),
                title: "Genetics".to_string(),
                page_start: 31,
                page_end: 60,
                content: "Genes, DNA, inheritance, alleles and mutations."
                    .to_string(),
            },
        ]
    }

    async fn build(server: &ChapterIndexMcpServer) {
        server
            .chapter_index_build(Parameters(BuildParams {
                textbook_id: "bio-101".to_string(),
                chapters: chapters(),
            }))
            .await
            .unwrap();
    }

    fn summary_text(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn search_tool_returns_structured_results() {
        let (_tmp, server) = server();
        build(&server).await;

        let result = server
            .chapter_search(Parameters(SearchParams {
                textbook_id: "bio-101".to_string(),
                query: "DNA inheritance and mutations".to_string(),
                top_k: Some(1),
            }))
            .await
            .unwrap();

        let structured = result.structured_content.clone().expect("structured");
        let results = structured
            .get("results")
            .and_then(|v| v.as_array())
            .expect("results array");
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0]
                .pointer("/chapter/title")
                .and_then(|v| v.as_str()),
            Some("Genetics")
        );
        assert!(summary_text(&result).contains("Found 1 chapter"));
    }

    #[tokio::test]
    async fn map_tool_echoes_question_ids_in_order() {
        let (_tmp, server) = server();
        build(&server).await;

        let result = server
            .chapter_map_questions(Parameters(MapParams {
                textbook_id: "bio-101".to_string(),
                questions: vec![
                    Question::new(10, "What is an organelle?"),
                    Question::new("q2", "How are alleles inherited?"),
                ],
                top_k: Some(2),
            }))
            .await
            .unwrap();

        let structured = result.structured_content.expect("structured");
        let mappings = structured
            .get("mappings")
            .and_then(|v| v.as_array())
            .expect("mappings array");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0]["question_id"], json!(10));
        assert_eq!(mappings[1]["question_id"], json!("q2"));
        assert_eq!(
            mappings[1]["chapters"].as_array().map(Vec::len),
            Some(2)
        );
    }

    #[tokio::test]
    async fn missing_index_is_invalid_params() {
        let (_tmp, server) = server();
        let err = server
            .chapter_search(Parameters(SearchParams {
                textbook_id: "nothing".to_string(),
                query: "anything".to_string(),
                top_k: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
        assert_eq!(
            err.data.as_ref().and_then(|d| d.get("needsReindex")),
            Some(&json!(true))
        );
    }

    #[tokio::test]
    async fn bad_textbook_id_is_rejected() {
        let (_tmp, server) = server();
        let err = server
            .chapter_index_health(Parameters(TextbookParams {
                textbook_id: "../escape".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn health_and_delete_tools() {
        let (_tmp, server) = server();
        build(&server).await;

        let health = server
            .chapter_index_health(Parameters(TextbookParams {
                textbook_id: "bio-101".to_string(),
            }))
            .await
            .unwrap();
        let report = health.structured_content.clone().expect("structured");
        assert_eq!(report["ok"], json!(true));
        assert_eq!(report["chapter_count"], json!(2));

        let deleted = server
            .chapter_index_delete(Parameters(TextbookParams {
                textbook_id: "bio-101".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(
            deleted.structured_content.expect("structured")["removed"],
            json!(true)
        );

        let again = server
            .chapter_index_delete(Parameters(TextbookParams {
                textbook_id: "bio-101".to_string(),
            }))
            .await
            .unwrap();
        assert!(summary_text(&again).contains("No index"));
    }
}
