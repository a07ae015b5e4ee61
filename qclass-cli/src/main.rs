//! qclass-cli — command-line client for the qclass HTTP API
//!
//! # Subcommands
//! - `predict <query> [--session <uuid>] [--record <id>]` — classify a query
//! - `create <query> [--session <uuid>]`  — store a pending record
//! - `get <id>`                           — show one record
//! - `delete <id>`                        — delete one record
//! - `history <query>`                    — records for a query, newest first
//! - `status`                             — show server health
//!
//! `--json` prints the raw server response instead of the text summary.

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "qclass-cli", version, about = "Question classifier client")]
struct Cli {
    /// qclass HTTP server URL (overrides QCLASS_HTTP_URL env var)
    #[arg(long, env = "QCLASS_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify a query, served from cache when possible
    Predict {
        query: String,

        /// Session to attach the record to
        #[arg(short, long)]
        session: Option<String>,

        /// Complete this pending record instead of creating one
        #[arg(short, long)]
        record: Option<String>,
    },

    /// Create a pending record without predicting
    Create {
        query: String,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show a record by id
    Get { id: String },

    /// Delete a record by id
    Delete { id: String },

    /// List records stored for a query
    History { query: String },

    /// Show qclass server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

/// A record or prediction as returned by the HTTP API
#[derive(Debug, Deserialize)]
pub struct RecordView {
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    pub user_query: String,
    pub status: String,
    pub prediction_label: Option<String>,
    pub prediction_probability: Option<f64>,
    /// Only present on prediction responses
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryView {
    pub query: String,
    pub count: usize,
    pub records: Vec<RecordView>,
}

/// One-line human summary of a record.
pub fn format_record(r: &RecordView) -> String {
    let id = r.chat_id.as_deref().unwrap_or("-");
    let prediction = match (&r.prediction_label, r.prediction_probability) {
        (Some(label), Some(p)) => format!("{} ({:.1}%)", label, p * 100.0),
        _ => "no prediction".to_string(),
    };
    let source = r
        .source
        .as_deref()
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default();
    format!("{}  {:<9} {}{}  \"{}\"", id, r.status, prediction, source, r.user_query)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

/// Send a request and return the body, exiting on transport or HTTP errors.
fn send(request: reqwest::blocking::RequestBuilder, url: &str) -> anyhow::Result<String> {
    let resp = match request.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("qclass-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(body);
        eprintln!("qclass-cli: server returned {}: {}", status, message);
        std::process::exit(1);
    }
    Ok(body)
}

fn print_record_body(body: &str, json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", body);
        return Ok(());
    }
    let record: RecordView = serde_json::from_str(body)?;
    println!("{}", format_record(&record));
    Ok(())
}

/// Request body shared by `POST /api/predict` and `POST /chat`.
fn query_body(query: &str, session: Option<&str>, record: Option<&str>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "user_query": query,
        "session_id": session,
    });
    if let Some(id) = record {
        body["chat_id"] = serde_json::Value::from(id);
    }
    body
}

fn do_query(
    server: &str,
    endpoint: &str,
    query: &str,
    session: Option<&str>,
    record: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let url = format!("{}{}", server, endpoint);
    let body = query_body(query, session, record);
    let text = send(client()?.post(&url).json(&body), &url)?;
    print_record_body(&text, json_output)
}

fn do_get(server: &str, id: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/chat/{}", server, id);
    let text = send(client()?.get(&url), &url)?;
    print_record_body(&text, json_output)
}

fn do_delete(server: &str, id: &str) -> anyhow::Result<()> {
    let url = format!("{}/chat/{}", server, id);
    send(client()?.delete(&url), &url)?;
    println!("Deleted {}", id);
    Ok(())
}

fn do_history(server: &str, query: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/chat", server);
    let text = send(client()?.get(&url).query(&[("query", query)]), &url)?;
    if json_output {
        println!("{}", text);
        return Ok(());
    }
    let history: HistoryView = serde_json::from_str(&text)?;
    if history.records.is_empty() {
        eprintln!("No records found for: {}", history.query);
        return Ok(());
    }
    println!("{} record(s) for \"{}\"", history.count, history.query);
    for r in &history.records {
        println!("{}", format_record(r));
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let text = send(client()?.get(&url), &url)?;
    if json_output {
        println!("{}", text);
        return Ok(());
    }
    let body: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
    let cache = &body["cache"];
    println!("qclass server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
    println!("Store:         {}", body["store"].as_str().unwrap_or("?"));
    println!("Socket:        {}", body["socket"].as_str().unwrap_or("?"));
    println!(
        "Cache:         {}/{} entries, {} hits, {} misses",
        cache["entries"], cache["capacity"], cache["hits"], cache["misses"]
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Predict {
            query,
            session,
            record,
        } => do_query(
            &server,
            "/api/predict",
            &query,
            session.as_deref(),
            record.as_deref(),
            cli.json,
        ),
        Commands::Create { query, session } => {
            do_query(&server, "/chat", &query, session.as_deref(), None, cli.json)
        }
        Commands::Get { id } => do_get(&server, &id, cli.json),
        Commands::Delete { id } => do_delete(&server, &id),
        Commands::History { query } => do_history(&server, &query, cli.json),
        Commands::Status => do_status(&server, cli.json),
    };

    if let Err(e) = result {
        eprintln!("qclass-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_completed_prediction() {
        let record: RecordView = serde_json::from_value(serde_json::json!({
            "chat_id": "7b5c24ab-1234-5678-9abc-def012345678",
            "session_id": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "user_query": "What is 2+2?",
            "status": "completed",
            "prediction_label": "simple",
            "prediction_probability": 0.92,
            "source": "cache"
        }))
        .unwrap();
        let line = format_record(&record);
        assert!(line.starts_with("7b5c24ab-"));
        assert!(line.contains("simple (92.0%)"), "line was: {line}");
        assert!(line.contains("[cache]"));
        assert!(line.ends_with("\"What is 2+2?\""));
    }

    #[test]
    fn test_format_pending_record() {
        let record: RecordView = serde_json::from_value(serde_json::json!({
            "chat_id": "7b5c24ab-1234-5678-9abc-def012345678",
            "session_id": null,
            "user_query": "draft",
            "status": "pending",
            "prediction_label": null,
            "prediction_probability": null,
            "created_at": "2026-02-23T10:00:00Z"
        }))
        .unwrap();
        let line = format_record(&record);
        assert!(line.contains("no prediction"));
        assert!(!line.contains('['));
    }

    #[test]
    fn test_format_cache_hit_without_id() {
        let record: RecordView = serde_json::from_value(serde_json::json!({
            "chat_id": null,
            "user_query": "q",
            "status": "completed",
            "prediction_label": "complex",
            "prediction_probability": 0.5,
            "source": "cache"
        }))
        .unwrap();
        assert!(format_record(&record).starts_with("-  "));
    }

    #[test]
    fn test_predict_record_flag_sent_as_chat_id() {
        let id = "7b5c24ab-1234-5678-9abc-def012345678";
        let cli = Cli::try_parse_from(["qclass-cli", "predict", "What is 2+2?", "--record", id]).unwrap();
        let Commands::Predict { query, session, record } = cli.command else {
            panic!("expected predict");
        };
        let body = query_body(&query, session.as_deref(), record.as_deref());
        assert_eq!(body["chat_id"], id);
        assert_eq!(body["user_query"], "What is 2+2?");
        assert!(body["session_id"].is_null());

        assert!(query_body("q", None, None).get("chat_id").is_none());
    }

    #[test]
    fn test_cli_parses_global_json_flag() {
        let cli = Cli::try_parse_from(["qclass-cli", "get", "abc", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Get { ref id } if id == "abc"));
    }
}
