// src/main.rs

//! The main entry point for the OlivineDB coordination server.

use anyhow::Result;
use olivinedb::config::Config;
use olivinedb::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

/// Reads a `--flag value` pair from the argument list.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// A boolean switch: present on the command line, or set via environment.
fn switch(args: &[String], flag: &str, env_key: &str) -> bool {
    args.contains(&flag.to_string())
        || env::var(env_key).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("OlivineDB version {VERSION}");
        return Ok(());
    }

    // Configuration file first, then environment, then flags.
    let config_path = flag_value(&args, "--config")
        .or_else(|| env::var("OLIVINE_CONFIG").ok())
        .unwrap_or_else(|| "olivine.toml".to_string());
    let mut config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Operator overrides, each with an environment fallback.
    if let Some(url) = flag_value(&args, "--url").or_else(|| env::var("OLIVINE_URL").ok()) {
        match url.rsplit_once(':') {
            Some((host, port)) => {
                config.host = host.to_string();
                config.port = match port.parse() {
                    Ok(port) => port,
                    Err(_) => {
                        eprintln!("Invalid port in --url: {url}");
                        std::process::exit(1);
                    }
                };
            }
            None => config.host = url,
        }
    }
    if let Some(token) = flag_value(&args, "--token").or_else(|| env::var("OLIVINE_TOKEN").ok()) {
        config.auth_secret = Some(token);
    }
    if let Some(maps) = flag_value(&args, "--maps").or_else(|| env::var("OLIVINE_MAPS").ok()) {
        config.allowed_maps = Some(maps.split(',').map(|m| m.trim().to_string()).collect());
    }
    if switch(&args, "--no-mutations", "OLIVINE_NO_MUTATIONS") {
        config.enable_mutations = false;
    }
    if switch(&args, "--no-subscriptions", "OLIVINE_NO_SUBSCRIPTIONS") {
        config.enable_subscriptions = false;
    }
    if switch(&args, "--http", "OLIVINE_HTTP") {
        config.http.enabled = true;
    }
    if let Some(port) = flag_value(&args, "--port").or_else(|| env::var("OLIVINE_PORT").ok()) {
        config.port = match port.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("Invalid port number: {port}");
                std::process::exit(1);
            }
        };
    }
    if switch(&args, "--debug", "OLIVINE_DEBUG") {
        config.log_level = "debug".to_string();
    }

    // Logging: RUST_LOG wins over the configured level.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
