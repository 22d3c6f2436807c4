use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use credeval_core::domain::catalog::{
    CatalogTable, Country, ForeignCredential, GradeScale, Institution, ProgramLength,
    UsEquivalency,
};
use credeval_core::domain::conversation::{
    ToolExecutionRecord, ToolInvocationRequest, ToolOutcome,
};
use credeval_core::matching::{fold, rank, Ranked, DEFAULT_MATCH_LIMIT};
use credeval_db::repositories::{CatalogRepository, RepositoryError};

use crate::llm::ToolSchema;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("`{tool}` failed: {message}")]
    Execution { tool: String, message: String },
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "unknown_tool",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::Execution { .. } => "execution",
        }
    }

    fn execution(tool: &str, error: RepositoryError) -> Self {
        Self::Execution { tool: tool.to_string(), message: error.to_string() }
    }
}

/// A read-only catalog query the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn schema(&self) -> ToolSchema;
    /// Catalog table whose ids appear in this tool's `matches`.
    fn table(&self) -> CatalogTable;
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Fixed set of tools exposed to the model, in declaration order.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// The six catalog tools backed by `catalog`.
    pub fn catalog_tools(catalog: Arc<dyn CatalogRepository>) -> Self {
        let mut registry = Self::empty();
        registry.register(SearchCountries { catalog: catalog.clone() });
        registry.register(FindInstitutions { catalog: catalog.clone() });
        registry.register(GetForeignCredentials { catalog: catalog.clone() });
        registry.register(GetProgramLengths { catalog: catalog.clone() });
        registry.register(GetGradeScales { catalog: catalog.clone() });
        registry.register(GetUsEquivalencies { catalog });
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|tool| tool.schema()).collect()
    }

    pub fn table_for(&self, name: &str) -> Option<CatalogTable> {
        self.find(name).map(|tool| tool.table())
    }

    fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|tool| tool.name() == name).map(|tool| tool.as_ref())
    }

    pub async fn execute(&self, request: &ToolInvocationRequest) -> Result<Value, ToolError> {
        let tool = self
            .find(&request.tool_name)
            .ok_or_else(|| ToolError::UnknownTool { name: request.tool_name.clone() })?;
        tool.execute(&request.arguments).await
    }

    /// Executes `request` and captures timing. Failures become error records.
    pub async fn run(&self, request: &ToolInvocationRequest) -> ToolExecutionRecord {
        let started_at = Utc::now();
        let result = self.execute(request).await;
        let finished_at = Utc::now();

        let outcome = match result {
            Ok(payload) => ToolOutcome::Success { payload },
            Err(error) => {
                debug!(
                    event_name = "tool.execution_failed",
                    tool_name = %request.tool_name,
                    call_id = %request.call_id,
                    error_kind = error.kind(),
                    "tool invocation failed"
                );
                ToolOutcome::Error { kind: error.kind().to_string(), message: error.to_string() }
            }
        };
        ToolExecutionRecord::new(request.clone(), started_at, finished_at, outcome)
    }
}

fn required_str<'a>(
    tool: &str,
    arguments: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, ToolError> {
    match arguments.get(name) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(other) => Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("`{name}` must be a string, got {other}"),
        }),
        None => Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing required argument `{name}`"),
        }),
    }
}

fn optional_str<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
}

fn names_of(values: &[&Option<String>]) -> Vec<String> {
    values.iter().filter_map(|value| value.as_ref()).cloned().collect()
}

/// Ranks `rows` and renders them as a `matches` payload.
fn ranked_payload<T, F, R>(
    query: Option<&str>,
    rows: Vec<T>,
    names: F,
    render: R,
    extra: Map<String, Value>,
) -> Value
where
    F: Fn(&T) -> Vec<String>,
    R: Fn(&T) -> Value,
{
    let ranked = rank(query, rows, names, usize::MAX);
    let total_found = ranked.len();
    // A query with nothing left after folding lists every row unranked.
    let filtered = query.is_some_and(|query| !fold(query).is_empty());
    let matches = ranked
        .iter()
        .take(DEFAULT_MATCH_LIMIT)
        .map(|Ranked { item, kind, .. }| {
            let mut record = render(item);
            if let (Some(object), true) = (record.as_object_mut(), filtered) {
                object.insert("match_kind".to_string(), json!(kind.as_str()));
            }
            record
        })
        .collect::<Vec<_>>();

    let mut payload = extra;
    payload.insert("matches".to_string(), Value::Array(matches));
    payload.insert("total_found".to_string(), json!(total_found));
    if let Some(query) = query {
        payload.insert("search_query".to_string(), json!(query));
    }
    Value::Object(payload)
}

fn scope(country_name: &str) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("country_name".to_string(), json!(country_name));
    extra
}

fn country_schema() -> Value {
    json!({ "type": "string", "description": "Exact country name as returned by search_countries" })
}

fn query_schema(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

pub struct SearchCountries {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for SearchCountries {
    fn name(&self) -> &'static str {
        "search_countries"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "Search countries in the reference catalog by full or partial name. Use it to find the exact country name before any country-scoped lookup.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": query_schema("Country name or part of it, e.g. 'Korea' or 'Mexico'")
                },
                "required": ["query"]
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::Country
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let query = required_str(self.name(), arguments, "query")?;
        let countries =
            self.catalog.list_countries().await.map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            Some(query),
            countries,
            |country: &Country| vec![country.country_name.clone()],
            |country| json!({ "id": country.id(), "country_name": country.country_name }),
            Map::new(),
        ))
    }
}

pub struct FindInstitutions {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for FindInstitutions {
    fn name(&self) -> &'static str {
        "find_institutions"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "Find educational institutions in one country by native or English name.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "country_name": country_schema(),
                    "query": query_schema("Institution name or part of it, in any language")
                },
                "required": ["country_name", "query"]
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::Institution
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let country_name = required_str(self.name(), arguments, "country_name")?;
        let query = required_str(self.name(), arguments, "query")?;
        let rows = self
            .catalog
            .institutions_in(country_name)
            .await
            .map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            Some(query),
            rows,
            |row: &Institution| {
                names_of(&[&row.institution_name, &row.institution_english_name])
            },
            |row| {
                json!({
                    "id": row.id,
                    "institution_name": row.institution_name,
                    "institution_english_name": row.institution_english_name,
                    "accreditation_status": row.accreditation_status,
                    "institution_history": row.institution_history,
                })
            },
            scope(country_name),
        ))
    }
}

pub struct GetForeignCredentials {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for GetForeignCredentials {
    fn name(&self) -> &'static str {
        "get_foreign_credentials"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "List the foreign credential types recorded for a country, optionally filtered by name.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "country_name": country_schema(),
                    "query": query_schema("Optional credential name filter")
                },
                "required": ["country_name"]
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::ForeignCredential
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let country_name = required_str(self.name(), arguments, "country_name")?;
        let rows = self
            .catalog
            .foreign_credentials_in(country_name)
            .await
            .map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            optional_str(arguments, "query"),
            rows,
            |row: &ForeignCredential| names_of(&[&row.foreign_credential, &row.english_credential]),
            |row| {
                json!({
                    "id": row.id,
                    "foreign_credential": row.foreign_credential,
                    "english_credential": row.english_credential,
                    "additional_info": row.additional_info,
                })
            },
            scope(country_name),
        ))
    }
}

pub struct GetProgramLengths {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for GetProgramLengths {
    fn name(&self) -> &'static str {
        "get_program_lengths"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "List the typical program lengths recorded for a country.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "country_name": country_schema(),
                    "query": query_schema("Optional length filter, e.g. '4 years'")
                },
                "required": ["country_name"]
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::ProgramLength
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let country_name = required_str(self.name(), arguments, "country_name")?;
        let rows = self
            .catalog
            .program_lengths_in(country_name)
            .await
            .map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            optional_str(arguments, "query"),
            rows,
            |row: &ProgramLength| names_of(&[&row.program_length]),
            |row| json!({ "id": row.id, "program_length": row.program_length }),
            scope(country_name),
        ))
    }
}

pub struct GetGradeScales {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for GetGradeScales {
    fn name(&self) -> &'static str {
        "get_grade_scales"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "List the grading scales recorded for a country with their grade bands and conversion notes.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "country_name": country_schema(),
                    "query": query_schema("Optional scale filter, e.g. '4.5'")
                },
                "required": ["country_name"]
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::GradeScale
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let country_name = required_str(self.name(), arguments, "country_name")?;
        let rows = self
            .catalog
            .grade_scales_in(country_name)
            .await
            .map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            optional_str(arguments, "query"),
            rows,
            |row: &GradeScale| names_of(&[&row.grade_scale]),
            |row| {
                json!({
                    "id": row.id,
                    "grade_scale": row.grade_scale,
                    "bifurcation_setup": row.bifurcation_setup,
                    "grade_notes": row.grade_notes,
                    "conversion_factor": row.conversion_factor,
                })
            },
            scope(country_name),
        ))
    }
}

pub struct GetUsEquivalencies {
    catalog: Arc<dyn CatalogRepository>,
}

#[async_trait]
impl Tool for GetUsEquivalencies {
    fn name(&self) -> &'static str {
        "get_us_equivalencies"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name(),
            description: "List U.S. equivalency statements, optionally filtered by level.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": query_schema("Optional level filter, e.g. 'bachelor'")
                }
            }),
        }
    }

    fn table(&self) -> CatalogTable {
        CatalogTable::UsEquivalency
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let rows =
            self.catalog.us_equivalencies().await.map_err(|e| ToolError::execution(self.name(), e))?;
        Ok(ranked_payload(
            optional_str(arguments, "query"),
            rows,
            |row: &UsEquivalency| {
                names_of(&[&row.overall_equivalency, &row.equivalency_description])
            },
            |row| {
                json!({
                    "id": row.id,
                    "overall_equivalency": row.overall_equivalency,
                    "equivalency_description": row.equivalency_description,
                })
            },
            Map::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use credeval_core::domain::conversation::ToolInvocationRequest;
    use credeval_db::FixtureCatalog;

    use super::{ToolError, ToolRegistry};

    fn registry() -> ToolRegistry {
        ToolRegistry::catalog_tools(Arc::new(FixtureCatalog::in_memory()))
    }

    fn request(tool: &str, arguments: Value) -> ToolInvocationRequest {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ToolInvocationRequest::new("call-1", tool, arguments)
    }

    fn ids(payload: &Value) -> Vec<String> {
        payload["matches"]
            .as_array()
            .map(|matches| {
                matches.iter().filter_map(|m| m["id"].as_str().map(str::to_string)).collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn registry_exposes_six_tools_in_order() {
        let registry = registry();
        assert_eq!(
            registry.names(),
            vec![
                "search_countries",
                "find_institutions",
                "get_foreign_credentials",
                "get_program_lengths",
                "get_grade_scales",
                "get_us_equivalencies",
            ]
        );
        assert!(registry.schemas().iter().all(|schema| schema.parameters["type"] == "object"));
    }

    #[tokio::test]
    async fn search_countries_finds_korea_once() {
        let payload = registry()
            .execute(&request("search_countries", json!({ "query": "Korea" })))
            .await
            .expect("search");
        assert_eq!(ids(&payload), vec!["Republic of Korea".to_string()]);
        assert_eq!(payload["total_found"], 1);
        assert_eq!(payload["matches"][0]["match_kind"], "substring");
    }

    #[tokio::test]
    async fn institution_search_ignores_diacritics_and_case() {
        let payload = registry()
            .execute(&request(
                "find_institutions",
                json!({ "country_name": "canada", "query": "universite de montreal" }),
            ))
            .await
            .expect("search");
        assert_eq!(ids(&payload), vec!["inst-ca-montreal".to_string()]);
    }

    #[tokio::test]
    async fn institution_search_matches_english_name() {
        let payload = registry()
            .execute(&request(
                "find_institutions",
                json!({ "country_name": "Republic of Korea", "query": "Seoul National" }),
            ))
            .await
            .expect("search");
        assert_eq!(ids(&payload), vec!["inst-kr-snu".to_string()]);
    }

    #[tokio::test]
    async fn unknown_country_yields_empty_matches() {
        let payload = registry()
            .execute(&request(
                "find_institutions",
                json!({ "country_name": "Atlantis", "query": "University" }),
            ))
            .await
            .expect("empty result is not an error");
        assert_eq!(payload["matches"], json!([]));
        assert_eq!(payload["total_found"], 0);
    }

    #[tokio::test]
    async fn listing_without_query_returns_every_row_sorted() {
        let payload = registry()
            .execute(&request("get_program_lengths", json!({ "country_name": "Republic of Korea" })))
            .await
            .expect("list");
        assert_eq!(ids(&payload), vec!["pl-kr-2".to_string(), "pl-kr-4".to_string()]);
        assert!(payload["matches"][0].get("match_kind").is_none());
    }

    #[tokio::test]
    async fn punctuation_only_query_lists_rows_without_match_kind() {
        let payload = registry()
            .execute(&request("search_countries", json!({ "query": "!!!" })))
            .await
            .expect("search");
        assert_eq!(payload["total_found"], 5);
        let matches = payload["matches"].as_array().cloned().unwrap_or_default();
        assert_eq!(matches.len(), 5);
        assert!(matches.iter().all(|record| record.get("match_kind").is_none()));
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_arguments_are_tool_errors() {
        let registry = registry();
        let unknown = registry
            .execute(&request("lookup_everything", json!({})))
            .await
            .expect_err("unknown tool");
        assert!(matches!(unknown, ToolError::UnknownTool { .. }));

        let missing = registry
            .execute(&request("find_institutions", json!({ "country_name": "Canada" })))
            .await
            .expect_err("query is required");
        assert_eq!(missing.kind(), "invalid_arguments");

        let record = registry.run(&request("lookup_everything", json!({}))).await;
        assert!(!record.is_success());
        assert!(record.finished_at() >= record.started_at());
        assert_eq!(record.model_payload()["error_kind"], "unknown_tool");
    }

    #[tokio::test]
    async fn identical_calls_are_deterministic() {
        let registry = registry();
        let call = request("get_us_equivalencies", json!({ "query": "bachelor" }));
        let first = registry.execute(&call).await.expect("first");
        let second = registry.execute(&call).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(ids(&first).first().map(String::as_str), Some("us-bachelor"));
    }
}
