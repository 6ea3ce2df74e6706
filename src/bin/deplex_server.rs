//!
//! deplex server binary
//! --------------------
//! Command-line entry point for the package index server. Picks the store
//! variant, opens the index root and runs the TCP frontend until interrupted.
//! Supports configuration via CLI flags and environment variables; flags win.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use deplex::index::IndexKind;
use deplex::server::IndexServer;

fn parse_port_env(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(val) => val.parse::<u16>().ok(),
        Err(_) => None,
    }
}

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    parse_str_arg(args, flag).and_then(|v| v.parse::<u16>().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag
            && i + 1 < args.len() {
                return Some(args[i + 1].clone());
            }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Map the `-l` level names onto a tracing directive. `CRITICAL` is accepted
/// for operators used to the old tooling and treated as `error`.
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("deplex package index server\n\nUSAGE:\n  deplex_server [-i DIR] [-o HOST] [-p PORT] [-l LEVEL] [-t KIND]\n\nOPTIONS:\n  -i DIR     Index root directory (env: DEPLEX_INDEX_DIR, default: current dir)\n  -o HOST    Host name or ip address to bind (env: DEPLEX_HOST, default 0.0.0.0)\n  -p PORT    TCP port to bind (env: DEPLEX_PORT, default 8080)\n  -l LEVEL   Log verbosity: TRACE|DEBUG|INFO|WARN|ERROR (env: DEPLEX_LOG, default INFO)\n  -t KIND    Store variant: filesystem|memory (env: DEPLEX_STORE, default filesystem)\n");
        return Ok(());
    }

    // Environment variables
    let env_index_dir = env::var("DEPLEX_INDEX_DIR").ok();
    let env_host = env::var("DEPLEX_HOST").ok();
    let env_port = parse_port_env("DEPLEX_PORT");
    let env_level = env::var("DEPLEX_LOG").ok();
    let env_kind = env::var("DEPLEX_STORE").ok();

    // CLI arguments override environment
    let index_dir = parse_str_arg(&args, "-i")
        .or(env_index_dir)
        .unwrap_or_else(|| ".".to_string());
    let host = parse_str_arg(&args, "-o").or(env_host).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = parse_port_arg(&args, "-p").or(env_port).unwrap_or(8080);
    let level = parse_str_arg(&args, "-l").or(env_level).unwrap_or_else(|| "INFO".to_string());
    let kind_name = parse_str_arg(&args, "-t").or(env_kind).unwrap_or_else(|| "filesystem".to_string());

    // Initialize tracing; an explicit RUST_LOG wins over the -l level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_directive(&level)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let kind: IndexKind = kind_name
        .parse()
        .with_context(|| format!("while parsing store variant '{}'", kind_name))?;

    println!(
        "deplex starting: bind={}:{}, index_dir={}, store={:?}",
        host, port, index_dir, kind
    );
    tracing::info!("starting: bind={}:{}, index_dir={}, store={:?}", host, port, index_dir, kind);

    std::fs::create_dir_all(&index_dir)
        .with_context(|| format!("Failed to create or access index root: {}", index_dir))?;
    let index = kind
        .open(Path::new(&index_dir))
        .with_context(|| format!("While opening {:?} index under {}", kind, index_dir))?;

    let server = IndexServer::bind(&format!("{}:{}", host, port), index).await?;
    let handle = server.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    handle.stop(Duration::from_secs(5)).await;
    Ok(())
}
