//! inspector-cli - command-line client for the inspector HTTP API
//!
//! # Subcommands
//! - `start <node> [--new-username U --new-password P]` - start introspection
//! - `status <node> [--json]`                           - show introspection status
//! - `health`                                           - show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5050";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "inspector-cli",
    version,
    about = "Start and monitor bare-metal node introspection"
)]
struct Cli {
    /// Inspector HTTP server URL (overrides INSPECTOR_HTTP_URL env var)
    #[arg(long, env = "INSPECTOR_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start introspection of a node
    Start {
        /// Node UUID
        node: String,

        /// New IPMI user name to set on the BMC
        #[arg(long, requires = "new_password")]
        new_username: Option<String>,

        /// New IPMI password to set on the BMC (letters and digits, up to 20)
        #[arg(long)]
        new_password: Option<String>,
    },

    /// Show introspection status of a node
    Status {
        /// Node UUID
        node: String,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Show inspector server health
    Health,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub finished: bool,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// One-line human summary of a status response.
pub fn describe_status(node: &str, status: &StatusResponse) -> String {
    match (status.finished, &status.error) {
        (false, _) => format!(
            "{}: in progress (started {})",
            node,
            status.started_at.as_deref().unwrap_or("?")
        ),
        (true, None) => format!(
            "{}: finished successfully at {}",
            node,
            status.finished_at.as_deref().unwrap_or("?")
        ),
        (true, Some(error)) => format!(
            "{}: failed at {}: {}",
            node,
            status.finished_at.as_deref().unwrap_or("?"),
            error
        ),
    }
}

/// Pull the error message out of an API error body, falling back to the raw text.
pub fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

fn fail_on_error(resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if resp.status().is_success() {
        return resp;
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    eprintln!("inspector-cli: server returned {}: {}", status, api_error_message(&body));
    std::process::exit(1);
}

fn do_start(
    server: &str,
    node: &str,
    new_username: Option<String>,
    new_password: Option<String>,
) -> anyhow::Result<()> {
    let url = format!("{}/v1/introspection/{}", server, node);
    let mut req = client()?.post(&url);
    if new_password.is_some() {
        req = req.json(&serde_json::json!({
            "new_ipmi_username": new_username,
            "new_ipmi_password": new_password,
        }));
    }

    let resp = match req.send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("inspector-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    fail_on_error(resp);

    println!("Introspection of {} started", node);
    Ok(())
}

fn do_status(server: &str, node: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/v1/introspection/{}", server, node);
    let resp = match client()?.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("inspector-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let resp = fail_on_error(resp);

    let body: serde_json::Value = resp.json()?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let status: StatusResponse = serde_json::from_value(body)?;
        println!("{}", describe_status(node, &status));
    }
    Ok(())
}

fn do_health(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);

    match client()?.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Inspector server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!("SQLite:           {}", body["sqlite"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("inspector-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("inspector-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Start {
            node,
            new_username,
            new_password,
        } => do_start(&server, &node, new_username, new_password),
        Commands::Status { node, json } => do_status(&server, &node, json),
        Commands::Health => do_health(&server),
    };

    if let Err(e) = result {
        eprintln!("inspector-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
