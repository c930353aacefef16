//! Thin client over the blah-code daemon, plus `serve` to run the daemon
//! itself. Exit code 0 on success, 1 for any failure (including missing
//! credentials).

use anyhow::{Result, anyhow};
use blah_core::{AppConfig, EventRecord, credentials_path, data_dir};
use blah_daemon::{Daemon, DaemonPaths};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "blah")]
#[command(about = "Local-first coding agent daemon and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt and print the agent's answer.
    Run(RunArgs),
    /// Print a session's event log.
    Events(EventsArgs),
    /// Run the daemon in the foreground.
    Serve,
    /// Show daemon status.
    Status,
    /// Show the daemon's recent log lines.
    Logs(LogsArgs),
    /// List sessions.
    Sessions(SessionsArgs),
    /// Store the provider API key.
    Login,
}

#[derive(Args)]
struct RunArgs {
    prompt: String,
    /// Reuse an existing session instead of creating one.
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args)]
struct EventsArgs {
    session_id: String,
    /// Keep the connection open and print new events as they arrive.
    #[arg(long)]
    follow: bool,
}

#[derive(Args)]
struct LogsArgs {
    #[arg(long, default_value_t = 100)]
    lines: usize,
}

#[derive(Args)]
struct SessionsArgs {
    #[arg(long, default_value_t = 20)]
    limit: u64,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli) {
        eprintln!("blah: {err}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let workspace = std::env::current_dir()?;
    let config = AppConfig::load(&workspace)?;
    match cli.command {
        Commands::Serve => {
            let daemon = Daemon::new(workspace, config, DaemonPaths::default())?;
            daemon.serve()
        }
        Commands::Run(args) => run_prompt(&config, args),
        Commands::Events(args) => show_events(&config, args),
        Commands::Status => {
            let status = get(&config, "/v1/status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Logs(args) => {
            let logs = get(&config, &format!("/v1/logs?lines={}", args.lines))?;
            for line in logs["lines"].as_array().into_iter().flatten() {
                println!("{}", line.as_str().unwrap_or_default());
            }
            Ok(())
        }
        Commands::Sessions(args) => {
            let body = get(&config, &format!("/v1/sessions?limit={}", args.limit))?;
            for session in body["sessions"].as_array().into_iter().flatten() {
                println!(
                    "{}  {}  {} events  {}",
                    session["id"].as_str().unwrap_or("?"),
                    format_millis(session["lastEventAt"].as_i64().unwrap_or_else(|| {
                        session["createdAt"].as_i64().unwrap_or_default()
                    })),
                    session["eventCount"].as_i64().unwrap_or_default(),
                    session["name"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }
        Commands::Login => login(),
    }
}

fn run_prompt(config: &AppConfig, args: RunArgs) -> Result<()> {
    let session = match args.session {
        Some(session) => session,
        None => {
            let created = post(config, "/v1/sessions", json!({}))?;
            created["sessionId"]
                .as_str()
                .ok_or_else(|| anyhow!("daemon returned no session id"))?
                .to_string()
        }
    };
    let mut body = json!({"prompt": args.prompt});
    if let Some(model) = args.model {
        body["modelId"] = json!(model);
    }
    let reply = post(config, &format!("/v1/sessions/{session}/prompt"), body)?;
    println!(
        "{}",
        reply["output"].as_str().unwrap_or_default()
    );
    eprintln!("session: {session}");
    Ok(())
}

fn show_events(config: &AppConfig, args: EventsArgs) -> Result<()> {
    let events: Vec<EventRecord> = serde_json::from_value(get(
        config,
        &format!("/v1/sessions/{}/events", args.session_id),
    )?)?;
    for event in &events {
        print_event(event);
    }
    if !args.follow {
        return Ok(());
    }

    // Tail the SSE stream; the snapshot frame repeats what we printed, so
    // skip records we have already seen by id.
    let last_seen = events.last().map(|e| e.id).unwrap_or(0);
    let response = client(None)?
        .get(format!(
            "{}/v1/sessions/{}/events/stream",
            base_url(config),
            args.session_id
        ))
        .send()?;
    if !response.status().is_success() {
        return Err(anyhow!("stream failed: HTTP {}", response.status()));
    }
    let reader = BufReader::new(response);
    for line in reader.lines() {
        let line = line?;
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(event) = value.get("event") {
            let Ok(record) = serde_json::from_value::<EventRecord>(event.clone()) else {
                continue;
            };
            if record.id > last_seen {
                print_event(&record);
            }
        } else if let Some(snapshot) = value.get("events").and_then(|v| v.as_array()) {
            for event in snapshot {
                let Ok(record) = serde_json::from_value::<EventRecord>(event.clone()) else {
                    continue;
                };
                if record.id > last_seen {
                    print_event(&record);
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &EventRecord) {
    println!(
        "{}  {:<20} {}",
        format_millis(event.created_at),
        event.kind,
        event.payload
    );
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn login() -> Result<()> {
    eprint!("API key: ");
    let mut key = String::new();
    std::io::stdin().read_line(&mut key)?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("no key entered"));
    }
    std::fs::create_dir_all(data_dir())?;
    let path = credentials_path();
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "{}", json!({"apiKey": key}))?;
    eprintln!("stored credentials at {}", path.display());
    Ok(())
}

// ── Daemon HTTP client ───────────────────────────────────────────────────

fn base_url(config: &AppConfig) -> String {
    match &config.daemon.attach_url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("http://{}:{}", config.daemon.host, config.daemon.port),
    }
}

fn client(timeout: Option<Duration>) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    } else {
        // Prompt runs and SSE tails can be long-lived.
        builder = builder.timeout(None);
    }
    Ok(builder.build()?)
}

fn get(config: &AppConfig, path: &str) -> Result<Value> {
    let response = client(Some(Duration::from_secs(10)))?
        .get(format!("{}{path}", base_url(config)))
        .send()
        .map_err(connection_hint)?;
    decode(response)
}

fn post(config: &AppConfig, path: &str, body: Value) -> Result<Value> {
    let response = client(None)?
        .post(format!("{}{path}", base_url(config)))
        .json(&body)
        .send()
        .map_err(connection_hint)?;
    decode(response)
}

fn decode(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }
    let message = body["error"].as_str().unwrap_or("unknown error");
    Err(anyhow!("daemon returned HTTP {status}: {message}"))
}

fn connection_hint(err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() {
        anyhow!("cannot reach the daemon ({err}); start it with `blah serve`")
    } else {
        anyhow!(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_prefers_attach_url() {
        let mut config = AppConfig::default();
        assert_eq!(base_url(&config), "http://127.0.0.1:4517");
        config.daemon.attach_url = Some("http://10.0.0.2:9999/".to_string());
        assert_eq!(base_url(&config), "http://10.0.0.2:9999");
    }

    #[test]
    fn format_millis_is_rfc3339() {
        let formatted = format_millis(0);
        assert!(formatted.starts_with("1970-01-01T00:00:00"));
    }
}
