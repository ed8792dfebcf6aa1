//! Translation orchestrator
//!
//! Wires the pipeline together: question -> schema snapshot + domain lookup
//! -> prompt -> completion -> validation -> execution. Owns the retry
//! policy: validator rejections are terminal, transient failures get exactly
//! one retry with a shortened deadline, and a schema failure invalidates the
//! cache before its single retry.

use crate::completion::CompletionBackend;
use crate::config::Config;
use crate::error::{NlqError, Result};
use crate::executor::{QueryResult, SqlExecutor};
use crate::knowledge::DomainIndex;
use crate::prompt::PromptComposer;
use crate::schema::{SchemaModel, SchemaProvider};
use crate::validator::Validator;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

lazy_static! {
    // The platform name must never be treated as a data value by the model.
    static ref PLATFORM_NAME: Regex = Regex::new(r"(?i)katana").unwrap();
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub question: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

pub struct NlqEngine {
    config: Config,
    schema: Arc<dyn SchemaProvider>,
    knowledge: Arc<DomainIndex>,
    composer: PromptComposer,
    validator: Validator,
    completion: Arc<dyn CompletionBackend>,
    executor: Arc<dyn SqlExecutor>,
}

impl NlqEngine {
    pub fn new(
        config: Config,
        schema: Arc<dyn SchemaProvider>,
        knowledge: Arc<DomainIndex>,
        completion: Arc<dyn CompletionBackend>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        let composer = PromptComposer::new(config.prompt_max_chars);
        let validator = Validator::new(config.fuzzy_rewrite_types.clone());
        Self {
            config,
            schema,
            knowledge,
            composer,
            validator,
            completion,
            executor,
        }
    }

    /// The single inbound operation.
    pub async fn translate_and_run(&self, question: &str) -> Result<QueryOutcome> {
        let request_id = Uuid::new_v4();
        info!(%request_id, question, "translation request");

        let cleaned = preprocess_question(question);
        let schema = self.load_schema().await?;
        let domain_hits = self.knowledge.lookup_question(&cleaned);

        let prompt = self.composer.compose(&cleaned, &schema, &domain_hits)?;
        let raw = self.complete_with_retry(&prompt).await?;

        let validated = self
            .validator
            .validate(&raw, &schema, self.config.max_rows)?;
        info!(%request_id, sql = %validated.sql, "query validated");

        let result = self.execute_with_retry(&validated).await?;
        Ok(QueryOutcome {
            question: question.to_string(),
            sql: validated.sql,
            columns: result.columns,
            rows: result.rows,
        })
    }

    async fn load_schema(&self) -> Result<Arc<SchemaModel>> {
        match self.schema.load().await {
            Ok(snapshot) => Ok(snapshot),
            Err(NlqError::SchemaUnavailable(reason)) => {
                warn!(%reason, "schema load failed, invalidating cache and retrying");
                self.schema.invalidate();
                self.schema.load().await
            }
            Err(other) => Err(other),
        }
    }

    async fn complete_with_retry(&self, prompt: &str) -> Result<String> {
        let stop = stop_sequences();
        let max_tokens = self.config.completion_max_tokens;
        match self.completion.complete(prompt, max_tokens, &stop).await {
            Ok(raw) => Ok(raw),
            Err(NlqError::CompletionTimeout(_)) => {
                let shortened = self.config.request_timeout / 2;
                warn!(?shortened, "completion timed out, retrying with shortened deadline");
                tokio::time::timeout(
                    shortened,
                    self.completion.complete(prompt, max_tokens, &stop),
                )
                .await
                .map_err(|_| NlqError::CompletionTimeout(shortened))?
            }
            Err(other) => Err(other),
        }
    }

    async fn execute_with_retry(
        &self,
        validated: &crate::validator::ValidatedQuery,
    ) -> Result<QueryResult> {
        match self
            .executor
            .execute(validated, self.config.query_timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(NlqError::QueryTimeout(_)) => {
                let shortened = self.config.query_timeout / 2;
                warn!(?shortened, "query timed out, retrying with shortened deadline");
                self.executor.execute(validated, shortened).await
            }
            Err(other) => Err(other),
        }
    }
}

fn stop_sequences() -> Vec<String> {
    vec!["```".to_string(), "Question:".to_string(), "\n\n".to_string()]
}

/// Lowercase the question and neutralize the platform name so the model does
/// not use it as a filter value.
pub fn preprocess_question(question: &str) -> String {
    let lowered = question.to_lowercase();
    PLATFORM_NAME.replace_all(&lowered, "the platform").into_owned()
}
