use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("Prompt too large: {actual} chars exceeds ceiling of {ceiling}")]
    PromptTooLarge { actual: usize, ceiling: usize },

    #[error("Completion timed out after {0:?}")]
    CompletionTimeout(std::time::Duration),

    #[error("Completion engine error: {0}")]
    CompletionEngineError(String),

    #[error("SQL parse error: {0}")]
    Parse(String),

    #[error("Multiple statements rejected ({0} statements)")]
    MultiStatementRejected(usize),

    #[error("Write statement rejected: {0}")]
    WriteStatementRejected(String),

    #[error("Unknown schema reference: {0}")]
    UnknownSchemaReference(String),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(std::time::Duration),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NlqError>;

impl NlqError {
    /// Stable machine-readable code surfaced in API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            NlqError::SchemaUnavailable(_) => "SchemaUnavailable",
            NlqError::PromptTooLarge { .. } => "PromptTooLarge",
            NlqError::CompletionTimeout(_) => "CompletionTimeout",
            NlqError::CompletionEngineError(_) => "CompletionEngineError",
            NlqError::Parse(_) => "ParseError",
            NlqError::MultiStatementRejected(_) => "MultiStatementRejected",
            NlqError::WriteStatementRejected(_) => "WriteStatementRejected",
            NlqError::UnknownSchemaReference(_) => "UnknownSchemaReference",
            NlqError::QueryTimeout(_) => "QueryTimeout",
            NlqError::Execution(_) => "ExecutionError",
            NlqError::Config(_) => "ConfigError",
            NlqError::Io(_) => "IoError",
            NlqError::Json(_) => "JsonError",
        }
    }

    /// HTTP status for the API surface. Validator rejections are client
    /// errors; infrastructure failures are server errors.
    pub fn http_status(&self) -> u16 {
        match self {
            NlqError::Parse(_)
            | NlqError::MultiStatementRejected(_)
            | NlqError::WriteStatementRejected(_)
            | NlqError::UnknownSchemaReference(_)
            | NlqError::PromptTooLarge { .. } => 422,
            NlqError::Config(_) => 400,
            NlqError::CompletionTimeout(_) | NlqError::QueryTimeout(_) => 504,
            NlqError::SchemaUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Message safe to show an end user. Execution errors carry raw database
    /// text internally; only a summary leaves the process.
    pub fn user_message(&self) -> String {
        match self {
            NlqError::Execution(_) => {
                "The generated query failed to execute. The referenced tables or \
                 filters may not match the data."
                    .to_string()
            }
            NlqError::SchemaUnavailable(_) => {
                "The database schema could not be loaded. Try again shortly.".to_string()
            }
            NlqError::UnknownSchemaReference(name) => format!(
                "The generated query referenced '{}', which does not exist in the database schema.",
                name
            ),
            other => other.to_string(),
        }
    }

    /// Transient failures qualify for exactly one orchestrator-level retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NlqError::CompletionTimeout(_)
                | NlqError::QueryTimeout(_)
                | NlqError::SchemaUnavailable(_)
        )
    }
}
