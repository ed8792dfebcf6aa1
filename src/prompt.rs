//! Prompt Composer
//!
//! Builds the generation prompt from the schema snapshot, domain knowledge
//! excerpts and the user question. Deterministic for identical inputs, and
//! bounded: when the assembled prompt exceeds the configured ceiling, schema
//! tables with no overlap with the question are dropped first, then the
//! example and domain blocks, then remaining tables. The question itself is
//! never truncated.

use crate::error::{NlqError, Result};
use crate::knowledge::DomainEntry;
use crate::schema::{SchemaModel, Table};
use std::collections::HashSet;

const HEADER: &str = "You are an expert SQL assistant working on the Katana platform.\n\
Katana is an analytics platform that manages performance, vendors, counters, and \
operational data across multi-vendor networks.\n";

const INSTRUCTIONS: &str = "Instructions:\n\
- Use ONLY the columns and tables from the schema snapshot.\n\
- Do NOT invent values. Never use 'Katana' as a vendor name.\n\
- Use double quotes for column names with spaces (e.g., \"Alarm ID\").\n\
- When filtering on object or vendor names, prefer partial matching using ILIKE \
with wildcards (e.g., ILIKE '%bsc%').\n\
- Return a single SELECT statement and nothing else. No explanation.\n";

const EXAMPLES: &str = "Follow these examples when converting questions to SQL:\n\
# Objects and Families\n\
Q: What families do we have in the system?\n\
A: SELECT DISTINCT mapped_object_name FROM con_multivendors_counters_details LIMIT 50;\n\
# Counters for an Object\n\
Q: What is the list of counters covered for object X?\n\
A: SELECT counter_id, counter_description FROM con_multivendors_counters_details \
WHERE mapped_object_name ILIKE '%X%' LIMIT 50;\n\
# Fuzzy match on object type\n\
Q: What counters are available for 3G-related objects in the system?\n\
A: SELECT DISTINCT counter_id FROM con_multivendors_counters_details \
WHERE mapped_object_name ILIKE '%3G%' ORDER BY counter_id;\n\
# Vendors\n\
Q: What vendors does the platform support?\n\
A: SELECT vendor_name, vendor_description FROM vendors LIMIT 50;\n";

pub struct PromptComposer {
    max_chars: usize,
}

impl PromptComposer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Deterministic given identical inputs; byte-identical output is relied
    /// on by tests and by any caller-side caching.
    pub fn compose(
        &self,
        question: &str,
        schema: &SchemaModel,
        domain_hits: &[DomainEntry],
    ) -> Result<String> {
        let question_block = format!("Question: \"{}\"\nSQL:\n", question);
        let minimal_len = assemble(&question_block, &[], &[], &[], false).len();
        if minimal_len > self.max_chars {
            return Err(NlqError::PromptTooLarge {
                actual: minimal_len,
                ceiling: self.max_chars,
            });
        }

        let tokens = overlap_tokens(question, domain_hits);
        let (mut relevant, mut other): (Vec<&Table>, Vec<&Table>) = schema
            .tables()
            .iter()
            .partition(|t| table_overlaps(t, &tokens));

        let mut domain_lines: Vec<String> = domain_hits
            .iter()
            .map(|e| {
                format!(
                    "- {} ({:?}): {}",
                    e.term,
                    e.category,
                    e.description.trim()
                )
            })
            .collect();
        let mut include_examples = true;

        loop {
            let prompt = assemble(
                &question_block,
                &relevant,
                &other,
                &domain_lines,
                include_examples,
            );
            if prompt.len() <= self.max_chars {
                return Ok(prompt);
            }
            // Shrink in fixed order: zero-overlap tables, examples, domain
            // excerpt, then least-recently-partitioned relevant tables.
            if other.pop().is_some() {
                continue;
            }
            if include_examples {
                include_examples = false;
                continue;
            }
            if domain_lines.pop().is_some() {
                continue;
            }
            if relevant.pop().is_some() {
                continue;
            }
            // Nothing left but the minimal prompt, which fits by the check
            // above.
            return Ok(prompt);
        }
    }
}

fn assemble(
    question_block: &str,
    relevant: &[&Table],
    other: &[&Table],
    domain_lines: &[String],
    include_examples: bool,
) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');

    if !domain_lines.is_empty() {
        out.push_str("Domain Background:\n");
        for line in domain_lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }

    out.push_str("Schema Snapshot:\n");
    for table in relevant.iter().chain(other.iter()) {
        out.push_str(&render_table(table));
    }
    out.push('\n');

    if include_examples {
        out.push_str(EXAMPLES);
        out.push('\n');
    }

    out.push_str(INSTRUCTIONS);
    out.push('\n');
    out.push_str(question_block);
    out
}

fn render_table(table: &Table) -> String {
    let mut out = format!("Table: {}\n", table.name);
    for column in &table.columns {
        if column.nullable {
            out.push_str(&format!("- {}: {} (nullable)\n", column.name, column.data_type));
        } else {
            out.push_str(&format!("- {}: {}\n", column.name, column.data_type));
        }
    }
    for fk in &table.foreign_keys {
        out.push_str(&format!(
            "- FK {} -> {}({})\n",
            fk.column, fk.ref_table, fk.ref_column
        ));
    }
    out
}

fn overlap_tokens(question: &str, domain_hits: &[DomainEntry]) -> HashSet<String> {
    let mut tokens: HashSet<String> = question
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() >= 3)
        .collect();
    for hit in domain_hits {
        tokens.insert(hit.term.to_lowercase());
        for alias in &hit.aliases {
            tokens.insert(alias.to_lowercase());
        }
    }
    tokens
}

fn table_overlaps(table: &Table, tokens: &HashSet<String>) -> bool {
    let table_name = table.name.to_lowercase();
    for token in tokens {
        if table_name.contains(token) || token.contains(&table_name) {
            return true;
        }
        if table
            .columns
            .iter()
            .any(|c| c.name.to_lowercase().contains(token))
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::DomainCategory;
    use crate::schema::build_model;

    fn sample_schema() -> SchemaModel {
        let mut rows = vec![
            ("objects".into(), "id".into(), "integer".into(), "NO".into()),
            ("objects".into(), "name".into(), "text".into(), "YES".into()),
        ];
        // A wide table with no overlap with the question, so truncation has
        // an unambiguous first victim.
        for i in 0..40 {
            rows.push((
                "daily_rollup_unrelated".to_string(),
                format!("metric_{:02}", i),
                "double precision".to_string(),
                "YES".to_string(),
            ));
        }
        build_model(rows, vec![])
    }

    #[test]
    fn compose_is_deterministic() {
        let composer = PromptComposer::new(8000);
        let schema = sample_schema();
        let hits = vec![DomainEntry {
            term: "objects".into(),
            category: DomainCategory::Object,
            aliases: vec![],
            description: "Network objects tracked by the platform".into(),
        }];
        let a = composer
            .compose("What objects do we have in our system?", &schema, &hits)
            .unwrap();
        let b = composer
            .compose("What objects do we have in our system?", &schema, &hits)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn question_always_survives_truncation() {
        let composer = PromptComposer::new(900);
        let schema = sample_schema();
        let prompt = composer
            .compose("What objects do we have in our system?", &schema, &[])
            .unwrap();
        assert!(prompt.contains("What objects do we have in our system?"));
        assert!(prompt.len() <= 900);
    }

    #[test]
    fn zero_overlap_tables_are_dropped_first() {
        // Ceiling sized so that the full prompt overflows but dropping the
        // unrelated wide table is enough.
        let schema = sample_schema();
        let composer = PromptComposer::new(2100);
        let prompt = composer
            .compose("What objects do we have in our system?", &schema, &[])
            .unwrap();
        assert!(prompt.contains("Table: objects"));
        assert!(!prompt.contains("daily_rollup_unrelated"));
    }

    #[test]
    fn minimal_prompt_over_ceiling_is_rejected() {
        let composer = PromptComposer::new(100);
        let schema = SchemaModel::default();
        let err = composer
            .compose("What objects do we have in our system?", &schema, &[])
            .unwrap_err();
        assert!(matches!(err, NlqError::PromptTooLarge { .. }));
    }
}
