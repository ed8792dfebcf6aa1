//! HTTP server for the NLQ translation core
//! Single-endpoint JSON API using tokio and basic HTTP handling

use clap::Parser;
use katana_nlq::completion::LlamaServerClient;
use katana_nlq::config::Config;
use katana_nlq::db;
use katana_nlq::engine::NlqEngine;
use katana_nlq::error::NlqError;
use katana_nlq::executor::PgQueryExecutor;
use katana_nlq::knowledge::DomainIndex;
use katana_nlq::schema::{PgSchemaLoader, SchemaProvider};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "katana-nlq-server", about = "Natural-language query API")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

struct AppState {
    engine: NlqEngine,
    knowledge: Arc<DomainIndex>,
    schema: Arc<PgSchemaLoader>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let pool = db::init_pool(&config.database_url()).await?;
    let schema = Arc::new(PgSchemaLoader::new(pool.clone(), config.schema_cache_ttl));

    let knowledge = match DomainIndex::from_file(&config.domain_docs_path) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            warn!(error = %e, path = %config.domain_docs_path, "domain docs not loaded, starting with an empty index");
            Arc::new(DomainIndex::empty())
        }
    };

    let completion = Arc::new(LlamaServerClient::new(
        config.completion_url.clone(),
        config.completion_model.clone(),
        config.completion_temperature,
        config.request_timeout,
        config.completion_concurrency,
    ));
    let executor = Arc::new(PgQueryExecutor::new(pool, config.max_rows));

    let engine = NlqEngine::new(
        config.clone(),
        schema.clone() as Arc<dyn SchemaProvider>,
        knowledge.clone(),
        completion,
        executor,
    );

    let state = Arc::new(AppState {
        engine,
        knowledge,
        schema,
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                error!(%addr, error = %e, "connection handling failed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;
    let response = handle_request(&request, &state).await;
    stream.write_all(response.as_bytes()).await
}

/// Read the request head plus a Content-Length body.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(header_end) = find_header_end(&buffer) {
            let head = String::from_utf8_lossy(&buffer[..header_end]);
            let content_length = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let expected = header_end + 4 + content_length;
            if buffer.len() >= expected {
                break;
            }
        }
        if buffer.len() > 1_048_576 {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn handle_request(request: &str, state: &AppState) -> String {
    let request_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", r#"{"errorCode":"BadRequest","message":"malformed request"}"#);
    }

    let method = parts[0];
    let mut path = parts[1];
    if let Some(query_start) = path.find('?') {
        path = &path[..query_start];
    }
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    match (method, path) {
        ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok","service":"katana-nlq"}"#)
        }
        ("GET", "/api/schema") => match state.schema.load().await {
            Ok(snapshot) => {
                let body = serde_json::json!({ "tables": snapshot.tables() });
                json_response(200, "OK", &body)
            }
            Err(e) => error_response(&e),
        },
        ("POST", "/api/schema/invalidate") => {
            state.schema.invalidate();
            create_response(200, "OK", r#"{"status":"invalidated"}"#)
        }
        ("POST", "/api/knowledge/reload") => match state.knowledge.reload() {
            Ok(()) => create_response(200, "OK", r#"{"status":"reloaded"}"#),
            Err(e) => error_response(&e),
        },
        ("POST", "/api/query") => {
            let question = extract_question(request);
            let question = match question {
                Some(q) if !q.trim().is_empty() => q,
                _ => {
                    return create_response(
                        400,
                        "Bad Request",
                        r#"{"errorCode":"BadRequest","message":"body must be {\"question\": string}"}"#,
                    )
                }
            };
            match state.engine.translate_and_run(&question).await {
                Ok(outcome) => json_response(200, "OK", &serde_json::json!(outcome)),
                Err(e) => error_response(&e),
            }
        }
        ("OPTIONS", _) => create_response(200, "OK", ""),
        _ => create_response(
            404,
            "Not Found",
            &format!(
                r#"{{"errorCode":"NotFound","message":"no such endpoint: {} {}"}}"#,
                method, path
            ),
        ),
    }
}

fn extract_question(request: &str) -> Option<String> {
    let body_start = request.find("\r\n\r\n")? + 4;
    let body = request[body_start..].trim();
    let json_start = body.find('{')?;
    let parsed: serde_json::Value = serde_json::from_str(&body[json_start..]).ok()?;
    parsed
        .get("question")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn error_response(err: &NlqError) -> String {
    let status = err.http_status();
    let body = serde_json::json!({
        "errorCode": err.error_code(),
        "message": err.user_message(),
    });
    let status_text = match status {
        400 => "Bad Request",
        422 => "Unprocessable Entity",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    };
    json_response(status, status_text, &body)
}

fn json_response(status: u16, status_text: &str, body: &serde_json::Value) -> String {
    let rendered = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"errorCode":"InternalError","message":"serialization failed"}"#.to_string());
    create_response(status, status_text, &rendered)
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
