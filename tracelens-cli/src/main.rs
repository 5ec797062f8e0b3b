//! tracelens-cli — terminal frontend for the Tracelens analysis server
//!
//! Talks to the server's HTTP API: triggers an analysis for a captured chain
//! key and streams the result to stdout as it arrives, lists captured chains,
//! and shows server health.
//!
//! # Subcommands
//! - `analyze <guid> [-c <category> ...] [--show-prompt]` — stream an analysis
//! - `chains [--json]`                                    — list captured chains
//! - `status`                                             — show server health

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8790";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "tracelens-cli",
    version,
    about = "Tracelens — AI summaries for captured call-chain traces"
)]
struct Cli {
    /// Tracelens HTTP server URL (overrides TRACELENS_URL env var)
    #[arg(long, env = "TRACELENS_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze a captured chain and stream the summary
    Analyze {
        /// Chain key (guid) to analyze
        guid: String,

        /// Focus the analysis on a category; repeat for several.
        /// Omitted: all categories captured for the key.
        #[arg(short = 'c', long = "category")]
        categories: Vec<String>,

        /// Print the prompt that was sent once the analysis finishes
        #[arg(long)]
        show_prompt: bool,
    },

    /// List captured chain keys and their categories
    Chains {
        /// Output the raw JSON listing
        #[arg(long)]
        json: bool,
    },

    /// Show Tracelens server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChainsResponse {
    count: usize,
    chains: Vec<ChainSummary>,
}

#[derive(Debug, Deserialize)]
struct ChainSummary {
    guid: String,
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    text: String,
}

#[derive(Debug, Deserialize)]
struct DonePayload {
    text: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(default)]
    partial: String,
}

// ============================================================================
// SSE line parsing
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Event(String),
    Data(String),
    Other,
}

fn parse_sse_line(line: &str) -> SseLine {
    if let Some(name) = line.strip_prefix("event: ") {
        SseLine::Event(name.trim().to_string())
    } else if let Some(data) = line.strip_prefix("data: ") {
        SseLine::Data(data.to_string())
    } else {
        SseLine::Other
    }
}

/// The part of a cumulative text that was not printed yet. The server
/// re-sends the full accumulated text on every progress event, so printing
/// the suffix gives incremental output.
fn unseen_suffix(full: &str, printed: usize) -> &str {
    if full.len() > printed {
        &full[printed..]
    } else {
        ""
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

/// Trigger an analysis and stream its SSE events to the terminal.
fn do_analyze(
    server: &str,
    guid: &str,
    categories: &[String],
    show_prompt: bool,
) -> anyhow::Result<()> {
    // No client timeout: the stream stays open for as long as the model talks.
    let client = reqwest::blocking::Client::builder()
        .timeout(None::<std::time::Duration>)
        .build()?;

    let url = format!("{}/analyze", server);
    let mut body = serde_json::json!({ "guid": guid });
    if !categories.is_empty() {
        body["categories"] = serde_json::json!(categories);
    }

    let resp = match client.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tracelens-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("tracelens-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    let reader = BufReader::new(resp);
    let mut current_event = String::new();
    let mut printed = 0usize;

    for line in reader.lines() {
        let line = line?;
        match parse_sse_line(&line) {
            SseLine::Event(name) => current_event = name,
            SseLine::Data(data) => match current_event.as_str() {
                "progress" => {
                    let payload: ProgressPayload = serde_json::from_str(&data)?;
                    let suffix = unseen_suffix(&payload.text, printed);
                    if !suffix.is_empty() {
                        print!("{}", suffix);
                        std::io::stdout().flush().ok();
                        printed = payload.text.len();
                    }
                }
                "done" => {
                    let payload: DonePayload = serde_json::from_str(&data)?;
                    print!("{}", unseen_suffix(&payload.text, printed));
                    println!();
                    if show_prompt {
                        eprintln!("\n--- prompt sent to the model ---");
                        eprintln!("{}", payload.prompt);
                    }
                    return Ok(());
                }
                "error" => {
                    let payload: ErrorPayload = serde_json::from_str(&data)?;
                    let suffix = unseen_suffix(&payload.partial, printed);
                    if !suffix.is_empty() {
                        println!("{}", suffix);
                    }
                    eprintln!("tracelens-cli: analysis failed: {}", payload.message);
                    std::process::exit(1);
                }
                _ => {}
            },
            SseLine::Other => {}
        }
    }

    // Stream ended without a terminal event (server shut down mid-analysis).
    println!();
    Ok(())
}

/// List captured chains by calling GET /chains.
fn do_chains(server: &str, json_output: bool) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let url = format!("{}/chains", server);
    let resp = match client.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tracelens-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        eprintln!("tracelens-cli: server returned {}", resp.status());
        std::process::exit(1);
    }

    if json_output {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let listing: ChainsResponse = resp.json()?;
    if listing.chains.is_empty() {
        eprintln!("No chains captured yet — open the console through the proxy first.");
        return Ok(());
    }

    for chain in &listing.chains {
        if chain.categories.is_empty() {
            println!("{}", chain.guid);
        } else {
            println!("{}  [{}]", chain.guid, chain.categories.join(", "));
        }
    }
    eprintln!("{} chain(s) captured", listing.count);

    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    let resp = client.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!(
                "Tracelens server: {}",
                body["status"].as_str().unwrap_or("unknown")
            );
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!(
                "Upstream:         {}",
                body["upstream"]["url"].as_str().unwrap_or("?")
            );
            println!(
                "LLM configured:   {}",
                body["llm_configured"].as_bool().unwrap_or(false)
            );
            println!(
                "Captured chains:  {}",
                body["captured_chains"].as_u64().unwrap_or(0)
            );
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("tracelens-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("tracelens-cli: cannot reach {} — {}", url, e);
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
        Commands::Analyze {
            guid,
            categories,
            show_prompt,
        } => do_analyze(&server, &guid, &categories, show_prompt),
        Commands::Chains { json } => do_chains(&server, json),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("tracelens-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
