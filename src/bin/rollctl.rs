//! rollctl - command-line client for the rollgate control API
//!
//! Usage:
//!   rollctl status [app] [-n N]      Show instance reports
//!   rollctl start <app>              Roll out a new instance
//!   rollctl stop <app> [id] [--kill] Stop instances (all, or one by id)
//!   rollctl restart <app>            Alias for start

use anyhow::{Context, Result};
use rollgate::report::AppReport;
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Default control API address, matching the daemon's `rpc` defaults.
const DEFAULT_RPC_ADDR: &str = "127.0.0.1:9001";

#[derive(Debug)]
enum Command {
    Status { app: Option<String>, tail: Option<usize> },
    Start { app: String },
    Stop { app: String, instance: Option<u32>, kill: bool },
    Restart { app: String },
    Help,
    Version,
}

/// Error payload from the control API.
#[derive(Debug, serde::Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, serde::Deserialize)]
struct StartedInstance {
    instance: u32,
}

/// Minimal HTTP/1.1 client; the control API lives on loopback and every
/// exchange is a single request with `Connection: close`.
struct RpcClient {
    addr: String,
}

impl RpcClient {
    fn new() -> Self {
        let addr = env::var("ROLLGATE_RPC").unwrap_or_else(|_| DEFAULT_RPC_ADDR.to_string());
        Self { addr }
    }

    fn request(&self, method: &str, path: &str) -> Result<(u16, String)> {
        let mut stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("failed to connect to rollgate at {}", self.addr))?;

        stream.set_read_timeout(Some(std::time::Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(std::time::Duration::from_secs(30)))?;

        let request = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             \r\n",
            method, path, self.addr
        );
        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .context("malformed response from control API")?;
        let body = response
            .find("\r\n\r\n")
            .map(|idx| response[idx + 4..].to_string())
            .unwrap_or_default();

        Ok((status, body))
    }

    fn get(&self, path: &str) -> Result<(u16, String)> {
        self.request("GET", path)
    }

    fn post(&self, path: &str) -> Result<(u16, String)> {
        self.request("POST", path)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    match parse_command(&args) {
        Command::Help => print_help(),
        Command::Version => println!("rollctl {}", env!("CARGO_PKG_VERSION")),
        Command::Status { app, tail } => handle_status(app, tail)?,
        Command::Start { app } => handle_start(&app, "start")?,
        Command::Restart { app } => handle_start(&app, "restart")?,
        Command::Stop { app, instance, kill } => handle_stop(&app, instance, kill)?,
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Command {
    let Some(first) = args.first() else {
        return Command::Help;
    };

    match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "status" | "st" => {
            let app = args.get(1).filter(|s| !s.starts_with('-')).cloned();
            let tail = args
                .iter()
                .position(|a| a == "-n" || a == "--tail")
                .and_then(|i| args.get(i + 1))
                .and_then(|s| s.parse().ok());
            Command::Status { app, tail }
        }
        "start" => match args.get(1) {
            Some(app) => Command::Start { app: app.clone() },
            None => Command::Help,
        },
        "restart" => match args.get(1) {
            Some(app) => Command::Restart { app: app.clone() },
            None => Command::Help,
        },
        "stop" | "kill" => {
            let Some(app) = args.get(1).cloned() else {
                return Command::Help;
            };
            let instance = args.get(2).and_then(|s| s.parse().ok());
            let kill = first == "kill" || args.iter().any(|a| a == "--kill" || a == "-k");
            Command::Stop { app, instance, kill }
        }
        _ => Command::Help,
    }
}

fn handle_status(app: Option<String>, tail: Option<usize>) -> Result<()> {
    let client = RpcClient::new();

    let reports: Vec<AppReport> = match app {
        Some(name) => {
            let path = match tail {
                Some(n) => format!("/status/{}?n={}", name, n),
                None => format!("/status/{}", name),
            };
            let (status, body) = client.get(&path)?;
            if status != 200 {
                bail_with_message(status, &body);
            }
            vec![serde_json::from_str(&body).context("failed to parse status response")?]
        }
        None => {
            let (status, body) = client.get("/status")?;
            if status != 200 {
                bail_with_message(status, &body);
            }
            serde_json::from_str(&body).context("failed to parse status response")?
        }
    };

    for report in &reports {
        println!("{} ({}:{})", report.name, report.host, report.port);
        if report.instances.is_empty() {
            println!("  no instances");
        } else {
            println!(
                "  {:<6} {:<10} {:<6} {:<10} {:<25} {}",
                "ID", "STATUS", "PORT", "IN-FLIGHT", "STARTED", "EXITED"
            );
            for instance in &report.instances {
                println!(
                    "  {:<6} {:<10} {:<6} {:<10} {:<25} {}",
                    instance.id,
                    instance.status,
                    instance.port,
                    instance.in_flight,
                    instance.started_at.to_rfc3339(),
                    instance
                        .exited_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        println!();
    }

    Ok(())
}

fn handle_start(app: &str, verb: &str) -> Result<()> {
    let client = RpcClient::new();
    let (status, body) = client.post(&format!("/apps/{}/{}", app, verb))?;

    if status != 200 {
        bail_with_message(status, &body);
    }

    let started: StartedInstance =
        serde_json::from_str(&body).context("failed to parse start response")?;
    println!("Started instance {} for {}", started.instance, app);

    Ok(())
}

fn handle_stop(app: &str, instance: Option<u32>, kill: bool) -> Result<()> {
    let client = RpcClient::new();

    let mut path = format!("/apps/{}/stop?kill={}", app, kill);
    if let Some(id) = instance {
        path.push_str(&format!("&instance={}", id));
    }

    let (status, body) = client.post(&path)?;
    if status != 200 {
        bail_with_message(status, &body);
    }

    match instance {
        Some(id) => println!("Stopping instance {} of {}", id, app),
        None => println!("Stopping all running instances of {}", app),
    }

    Ok(())
}

fn bail_with_message(status: u16, body: &str) -> ! {
    let detail = serde_json::from_str::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| body.trim().to_string());
    eprintln!("Error: control API returned {}: {}", status, detail);
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"rollctl - rollgate control client

USAGE:
    rollctl <command> [options]

COMMANDS:
    status [app] [-n N]          Show instance reports (last N per app)
    start <app>                  Roll out a new instance
    restart <app>                Same as start; the old instance drains
                                 once the new one is healthy
    stop <app> [id] [--kill]     Stop instances gracefully, or SIGKILL
    kill <app> [id]              Shorthand for stop --kill

    help                         Show this help
    version                      Show version

ENVIRONMENT:
    ROLLGATE_RPC                 Control API address (default: {})
"#,
        DEFAULT_RPC_ADDR
    );
}
