//! SQL Validator & Sanitizer
//!
//! The staged pipeline between the completion engine and the executor:
//! raw text -> parsed -> statement-checked -> schema-checked -> sanitized.
//! Each stage is a total function returning the next stage's value or a
//! tagged rejection, so every rejection reason is testable in isolation.
//!
//! Schema checking is the anti-hallucination guarantee: every table and
//! column reference must resolve (case-insensitively) against the current
//! schema snapshot. Sanitizing rewrites equality predicates on textual
//! columns into case-insensitive fuzzy form (`col ILIKE '%literal%'`),
//! preserving predicate position and boolean structure.

use crate::error::{NlqError, Result};
use crate::schema::SchemaModel;
use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, JoinConstraint,
    JoinOperator, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
    Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use tracing::debug;

/// The only value allowed to reach the executor. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    pub sql: String,
    pub referenced_tables: BTreeSet<String>,
    pub referenced_columns: BTreeSet<String>,
}

pub struct Validator {
    /// Column type names whose equality predicates are rewritten to fuzzy
    /// form. Policy, not a fixed rule.
    fuzzy_types: Vec<String>,
}

impl Validator {
    pub fn new(fuzzy_types: Vec<String>) -> Self {
        Self {
            fuzzy_types: fuzzy_types.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    /// Run the full pipeline on a raw completion.
    pub fn validate(
        &self,
        raw: &str,
        schema: &SchemaModel,
        max_rows: u64,
    ) -> Result<ValidatedQuery> {
        let candidate = extract_sql(raw);
        let mut statement = parse_single(&candidate)?;
        ensure_read_only(&statement)?;

        let mut ctx = Ctx {
            schema,
            fuzzy_types: &self.fuzzy_types,
            referenced_tables: BTreeSet::new(),
            referenced_columns: BTreeSet::new(),
        };

        if let Statement::Query(query) = &mut statement {
            let mut stack: Vec<Scope> = Vec::new();
            check_query(query, &mut ctx, &mut stack)?;
            clamp_limit(query, max_rows);
        }

        let sql = statement.to_string();
        debug!(%sql, "query validated");
        Ok(ValidatedQuery {
            sql,
            referenced_tables: ctx.referenced_tables,
            referenced_columns: ctx.referenced_columns,
        })
    }
}

/// Stage 0: pull the SQL text out of a raw completion. Models wrap answers
/// in markdown fences or prefix them with a label; neither is SQL.
pub fn extract_sql(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```sql") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    let text = text.trim();
    let text = text.strip_prefix("SQL:").unwrap_or(text);
    text.trim().to_string()
}

/// Stage 1: parse, requiring exactly one statement. More than one statement
/// is a stacked-query attempt and is rejected outright.
fn parse_single(sql: &str) -> Result<Statement> {
    if sql.is_empty() {
        return Err(NlqError::Parse("empty completion".into()));
    }
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| NlqError::Parse(e.to_string()))?;
    match statements.len() {
        0 => Err(NlqError::Parse("no SQL statement found".into())),
        1 => Ok(statements.remove(0)),
        n => Err(NlqError::MultiStatementRejected(n)),
    }
}

/// Stage 2: only plain SELECT queries pass. Everything else, DDL and DML
/// alike, is a write statement from this system's point of view.
fn ensure_read_only(statement: &Statement) -> Result<()> {
    match statement {
        Statement::Query(query) => ensure_read_only_body(&query.body),
        other => Err(NlqError::WriteStatementRejected(statement_kind(other))),
    }
}

fn ensure_read_only_body(body: &SetExpr) -> Result<()> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(NlqError::WriteStatementRejected("SELECT INTO".into()));
            }
            Ok(())
        }
        SetExpr::Query(query) => ensure_read_only_body(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            ensure_read_only_body(left)?;
            ensure_read_only_body(right)
        }
        SetExpr::Values(_) => Ok(()),
        SetExpr::Insert(_) | SetExpr::Update(_) => {
            Err(NlqError::WriteStatementRejected("embedded write".into()))
        }
        SetExpr::Table(_) => Ok(()),
    }
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

/// Clamp the row count at the source: a missing or oversized LIMIT becomes
/// the configured cap.
fn clamp_limit(query: &mut Query, max_rows: u64) {
    let current = match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => n.parse::<u64>().ok(),
        _ => None,
    };
    match current {
        Some(n) if n <= max_rows => {}
        _ => {
            query.limit = Some(Expr::Value(Value::Number(max_rows.to_string(), false)));
        }
    }
}

struct Ctx<'a> {
    schema: &'a SchemaModel,
    fuzzy_types: &'a [String],
    referenced_tables: BTreeSet<String>,
    referenced_columns: BTreeSet<String>,
}

/// Name resolution scope for one SELECT. `tables` maps an alias (or bare
/// table name) to a canonical schema table. `open` holds relations whose
/// column sets cannot be verified (CTEs, derived tables): qualified
/// references through them pass, since they cannot hallucinate base schema.
#[derive(Default, Clone)]
struct Scope {
    tables: Vec<(String, String)>,
    open: Vec<String>,
    select_aliases: Vec<String>,
}

impl Scope {
    fn has_open(&self) -> bool {
        !self.open.is_empty()
    }
}

/// Stage 3 + 4 in one walk: resolve every table/column reference against the
/// schema snapshot, recording what was referenced, and rewrite qualifying
/// equality predicates in place.
fn check_query(query: &mut Query, ctx: &mut Ctx, stack: &mut Vec<Scope>) -> Result<()> {
    // The CTE scope goes on the stack before the bodies are checked: each
    // CTE may reference the ones defined before it in the same WITH list.
    stack.push(Scope::default());
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            check_query(&mut cte.query, ctx, stack)?;
            if let Some(scope) = stack.last_mut() {
                scope.open.push(cte.alias.name.value.to_lowercase());
            }
        }
    }

    let body_scope = check_set_expr(&mut query.body, ctx, stack)?;

    // ORDER BY and LIMIT resolve against the body's top scope, including
    // projection aliases.
    stack.push(body_scope);
    for order in &mut query.order_by {
        walk_expr(&mut order.expr, ctx, stack)?;
    }
    if let Some(limit) = &mut query.limit {
        walk_expr(limit, ctx, stack)?;
    }
    stack.pop();

    stack.pop(); // cte scope
    Ok(())
}

fn check_set_expr(body: &mut SetExpr, ctx: &mut Ctx, stack: &mut Vec<Scope>) -> Result<Scope> {
    match body {
        SetExpr::Select(select) => check_select(select, ctx, stack),
        SetExpr::Query(query) => {
            check_query(query, ctx, stack)?;
            Ok(Scope::default())
        }
        SetExpr::SetOperation { left, right, .. } => {
            let scope = check_set_expr(left, ctx, stack)?;
            check_set_expr(right, ctx, stack)?;
            // Column positions of a set operation follow the left arm.
            Ok(scope)
        }
        SetExpr::Values(values) => {
            for row in &mut values.rows {
                for expr in row {
                    walk_expr(expr, ctx, stack)?;
                }
            }
            Ok(Scope::default())
        }
        // Already rejected by the statement check.
        SetExpr::Insert(_) | SetExpr::Update(_) => {
            Err(NlqError::WriteStatementRejected("embedded write".into()))
        }
        // The bare `TABLE t` form still names a relation; it must resolve
        // like any other.
        SetExpr::Table(table) => {
            let name = table.table_name.clone().unwrap_or_default();
            let mut scope = Scope::default();
            if let Some(found) = ctx.schema.table(&name) {
                ctx.referenced_tables.insert(found.name.to_lowercase());
                scope.tables.push((name.to_lowercase(), found.name.clone()));
                Ok(scope)
            } else if stack.iter().any(|s| s.open.contains(&name.to_lowercase())) {
                scope.open.push(name.to_lowercase());
                Ok(scope)
            } else {
                Err(NlqError::UnknownSchemaReference(name))
            }
        }
    }
}

fn check_select(select: &mut Select, ctx: &mut Ctx, stack: &mut Vec<Scope>) -> Result<Scope> {
    let mut scope = Scope::default();
    for table_with_joins in &mut select.from {
        collect_relations(table_with_joins, ctx, stack, &mut scope)?;
    }
    stack.push(scope);

    // Join constraints see the full FROM scope.
    for table_with_joins in &mut select.from {
        for join in &mut table_with_joins.joins {
            if let Some(expr) = join_constraint_expr(&mut join.join_operator) {
                walk_expr(expr, ctx, stack)?;
            }
        }
    }

    let mut aliases = Vec::new();
    for item in &mut select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => walk_expr(expr, ctx, stack)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                walk_expr(expr, ctx, stack)?;
                aliases.push(alias.value.to_lowercase());
            }
            SelectItem::QualifiedWildcard(name, _) => {
                let qualifier = name
                    .0
                    .last()
                    .map(|i| i.value.clone())
                    .unwrap_or_default();
                resolve_qualifier(&qualifier, ctx, stack)?;
            }
            SelectItem::Wildcard(_) => {}
        }
    }

    if let Some(Distinct::On(exprs)) = &mut select.distinct {
        for expr in exprs {
            walk_expr(expr, ctx, stack)?;
        }
    }
    if let Some(selection) = &mut select.selection {
        walk_expr(selection, ctx, stack)?;
    }

    // Postgres resolves output aliases from GROUP BY onward (and in the
    // enclosing query's ORDER BY), but not in WHERE.
    if let Some(last) = stack.last_mut() {
        last.select_aliases = aliases;
    }
    if let GroupByExpr::Expressions(exprs) = &mut select.group_by {
        for expr in exprs {
            walk_expr(expr, ctx, stack)?;
        }
    }
    for expr in &mut select.sort_by {
        walk_expr(expr, ctx, stack)?;
    }
    if let Some(having) = &mut select.having {
        walk_expr(having, ctx, stack)?;
    }

    Ok(stack.pop().unwrap_or_default())
}

fn join_constraint_expr(op: &mut JoinOperator) -> Option<&mut Expr> {
    match op {
        JoinOperator::Inner(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr))
        | JoinOperator::RightOuter(JoinConstraint::On(expr))
        | JoinOperator::FullOuter(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    }
}

fn collect_relations(
    table_with_joins: &mut TableWithJoins,
    ctx: &mut Ctx,
    stack: &mut Vec<Scope>,
    scope: &mut Scope,
) -> Result<()> {
    collect_table_factor(&mut table_with_joins.relation, ctx, stack, scope)?;
    for join in &mut table_with_joins.joins {
        collect_table_factor(&mut join.relation, ctx, stack, scope)?;
    }
    Ok(())
}

fn collect_table_factor(
    factor: &mut TableFactor,
    ctx: &mut Ctx,
    stack: &mut Vec<Scope>,
    scope: &mut Scope,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            // Ignore a leading schema qualifier (public.objects).
            let bare = name
                .0
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default();
            let key = alias
                .as_ref()
                .map(|a| a.name.value.to_lowercase())
                .unwrap_or_else(|| bare.to_lowercase());

            if let Some(table) = ctx.schema.table(&bare) {
                ctx.referenced_tables.insert(table.name.to_lowercase());
                scope.tables.push((key, table.name.clone()));
                return Ok(());
            }
            // A CTE defined earlier in this query is a valid relation.
            let lowered = bare.to_lowercase();
            if stack.iter().any(|s| s.open.contains(&lowered)) {
                scope.open.push(key);
                return Ok(());
            }
            Err(NlqError::UnknownSchemaReference(bare))
        }
        TableFactor::Derived { subquery, alias, .. } => {
            check_query(subquery, ctx, stack)?;
            if let Some(alias) = alias {
                scope.open.push(alias.name.value.to_lowercase());
            } else {
                scope.open.push(String::new());
            }
            Ok(())
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_relations(table_with_joins, ctx, stack, scope),
        _ => Err(NlqError::Parse("unsupported FROM clause element".into())),
    }
}

fn walk_expr(expr: &mut Expr, ctx: &mut Ctx, stack: &mut Vec<Scope>) -> Result<()> {
    match expr {
        Expr::Identifier(ident) => {
            let name = ident.value.clone();
            resolve_unqualified(&name, ctx, stack)
        }
        Expr::CompoundIdentifier(parts) => {
            if parts.len() >= 2 {
                let column = parts[parts.len() - 1].value.clone();
                let qualifier = parts[parts.len() - 2].value.clone();
                resolve_qualified(&qualifier, &column, ctx, stack)
            } else {
                Ok(())
            }
        }
        Expr::BinaryOp { left, op, right } => {
            walk_expr(left, ctx, stack)?;
            walk_expr(right, ctx, stack)?;
            if *op == BinaryOperator::Eq {
                if let Some(rewritten) = fuzzy_rewrite(left, right, ctx, stack) {
                    *expr = rewritten;
                }
            }
            Ok(())
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => walk_expr(expr, ctx, stack),
        Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner) => walk_expr(inner, ctx, stack),
        Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => {
            walk_expr(a, ctx, stack)?;
            walk_expr(b, ctx, stack)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, ctx, stack)?;
            walk_expr(low, ctx, stack)?;
            walk_expr(high, ctx, stack)
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, ctx, stack)?;
            for item in list {
                walk_expr(item, ctx, stack)?;
            }
            Ok(())
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, ctx, stack)?;
            check_query(subquery, ctx, stack)
        }
        Expr::Like {
            expr, pattern, ..
        }
        | Expr::ILike {
            expr, pattern, ..
        }
        | Expr::SimilarTo {
            expr, pattern, ..
        } => {
            walk_expr(expr, ctx, stack)?;
            walk_expr(pattern, ctx, stack)
        }
        Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => walk_expr(expr, ctx, stack),
        Expr::Extract { expr, .. } => walk_expr(expr, ctx, stack),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, ctx, stack)?;
            }
            for condition in conditions {
                walk_expr(condition, ctx, stack)?;
            }
            for result in results {
                walk_expr(result, ctx, stack)?;
            }
            if let Some(else_result) = else_result {
                walk_expr(else_result, ctx, stack)?;
            }
            Ok(())
        }
        Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => {
            check_query(subquery, ctx, stack)
        }
        Expr::Function(function) => {
            for arg in &mut function.args {
                let arg_expr = match arg {
                    FunctionArg::Named { arg, .. } => arg,
                    FunctionArg::Unnamed(arg) => arg,
                };
                if let FunctionArgExpr::Expr(inner) = arg_expr {
                    walk_expr(inner, ctx, stack)?;
                }
            }
            Ok(())
        }
        Expr::Tuple(items) => {
            for item in items {
                walk_expr(item, ctx, stack)?;
            }
            Ok(())
        }
        // Literals and anything exotic: no identifiers to resolve, or the
        // construct was already rejected upstream by the dialect.
        _ => Ok(()),
    }
}

fn resolve_unqualified(name: &str, ctx: &mut Ctx, stack: &[Scope]) -> Result<()> {
    let lowered = name.to_lowercase();
    for scope in stack.iter().rev() {
        if scope.select_aliases.contains(&lowered) {
            return Ok(());
        }
        for (_, table_name) in &scope.tables {
            if let Some(table) = ctx.schema.table(table_name) {
                if let Some(column) = table.column(name) {
                    ctx.referenced_columns.insert(format!(
                        "{}.{}",
                        table.name.to_lowercase(),
                        column.name.to_lowercase()
                    ));
                    return Ok(());
                }
            }
        }
        // An unverifiable relation in scope means this name may come from
        // it; not provably a hallucination.
        if scope.has_open() {
            return Ok(());
        }
    }
    Err(NlqError::UnknownSchemaReference(name.to_string()))
}

fn resolve_qualified(qualifier: &str, column: &str, ctx: &mut Ctx, stack: &[Scope]) -> Result<()> {
    let q = qualifier.to_lowercase();
    for scope in stack.iter().rev() {
        for (alias, table_name) in &scope.tables {
            if *alias == q {
                let table = ctx
                    .schema
                    .table(table_name)
                    .ok_or_else(|| NlqError::UnknownSchemaReference(qualifier.to_string()))?;
                return match table.column(column) {
                    Some(col) => {
                        ctx.referenced_columns.insert(format!(
                            "{}.{}",
                            table.name.to_lowercase(),
                            col.name.to_lowercase()
                        ));
                        Ok(())
                    }
                    None => Err(NlqError::UnknownSchemaReference(format!(
                        "{}.{}",
                        qualifier, column
                    ))),
                };
            }
        }
        if scope.open.contains(&q) {
            return Ok(());
        }
    }
    Err(NlqError::UnknownSchemaReference(qualifier.to_string()))
}

fn resolve_qualifier(qualifier: &str, ctx: &mut Ctx, stack: &[Scope]) -> Result<()> {
    let q = qualifier.to_lowercase();
    for scope in stack.iter().rev() {
        if scope.tables.iter().any(|(alias, _)| *alias == q) || scope.open.contains(&q) {
            return Ok(());
        }
    }
    // Qualified wildcard before the scope is fully built, or over an
    // unknown relation.
    if ctx.schema.table(qualifier).is_some() {
        return Ok(());
    }
    Err(NlqError::UnknownSchemaReference(qualifier.to_string()))
}

/// Build the fuzzy replacement for `column = 'literal'` (either operand
/// order) when the column resolves to a configured textual type.
fn fuzzy_rewrite(
    left: &Expr,
    right: &Expr,
    ctx: &Ctx,
    stack: &[Scope],
) -> Option<Expr> {
    let (column_expr, literal) = match (string_literal(left), string_literal(right)) {
        (None, Some(lit)) => (left, lit),
        (Some(lit), None) => (right, lit),
        _ => return None,
    };

    let data_type = column_type(column_expr, ctx, stack)?;
    if !ctx.fuzzy_types.iter().any(|t| *t == data_type) {
        return None;
    }

    Some(Expr::ILike {
        negated: false,
        expr: Box::new(column_expr.clone()),
        pattern: Box::new(Expr::Value(Value::SingleQuotedString(format!(
            "%{}%",
            literal
        )))),
        escape_char: None,
    })
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Resolve a column expression's declared type, lowercased. `None` when the
/// expression is not a plain column or the column lives in an unverifiable
/// relation; those are never rewritten.
fn column_type(expr: &Expr, ctx: &Ctx, stack: &[Scope]) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => {
            for scope in stack.iter().rev() {
                for (_, table_name) in &scope.tables {
                    if let Some(column) = ctx
                        .schema
                        .table(table_name)
                        .and_then(|t| t.column(&ident.value))
                    {
                        return Some(column.data_type.to_lowercase());
                    }
                }
            }
            None
        }
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let qualifier = parts[parts.len() - 2].value.to_lowercase();
            let column = &parts[parts.len() - 1].value;
            for scope in stack.iter().rev() {
                for (alias, table_name) in &scope.tables {
                    if *alias == qualifier {
                        return ctx
                            .schema
                            .table(table_name)
                            .and_then(|t| t.column(column))
                            .map(|c| c.data_type.to_lowercase());
                    }
                }
            }
            None
        }
        _ => None,
    }
}
