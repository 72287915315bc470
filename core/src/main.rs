//! Courier Gateway CLI
//!
//! Run the notification gateway: HTTP ingestion in, messages out.
//!
//! Usage:
//!   courier-cli --serve --homeserver <URL> --user <ID>     # Run the gateway
//!   courier-cli --serve --port 8080                        # Custom ingestion port
//!   courier-cli --serve --management '!ops:example.org'    # Management channel

mod http;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use courier_core::{Gateway, GatewayConfig};

/// Read COURIER_PASSWORD, required to establish a fresh session.
fn password_from_env() -> String {
    env::var("COURIER_PASSWORD").unwrap_or_else(|_| {
        eprintln!("Error: COURIER_PASSWORD environment variable is not set.");
        eprintln!("  Set it to the gateway account's password, e.g.:");
        eprintln!("  export COURIER_PASSWORD='...'");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Courier Notification Gateway v0.1.0");
    println!();
    println!("Usage:");
    println!("  courier-cli --serve --homeserver <URL> --user <ID>   Run the gateway");
    println!();
    println!("Options:");
    println!("  --serve, -s                 Run in serve mode (required)");
    println!("  --homeserver <URL>          Homeserver base URL (required)");
    println!("  --user <ID>                 Gateway account, e.g. @courier:example.org (required)");
    println!("  --port <PORT>               Ingestion HTTP port (default: 8080)");
    println!("  --management <CHANNEL>      Channel for recipient-less deliveries");
    println!("  --db-path <PATH>            Session database path (default: user data dir)");
    println!("  --device-name <NAME>        Device display name (default: courier-gateway)");
    println!("  --max-retries <N>           Transient retry budget per delivery (default: 5)");
    println!("  --base-backoff-ms <MS>      Base retry delay (default: 500)");
    println!("  --max-backoff-ms <MS>       Retry delay cap (default: 30000)");
    println!("  --help, -h                  Show this help");
    println!();
    println!("Ingestion API:");
    println!("  POST /notify                Deliver a payload");
    println!("    Send-To: @user:domain     Optional recipient (or !channel:domain)");
    println!("    Api-Key: <secret>         Required when COURIER_API_KEY is set");
    println!("    File-Name: <name.ext>     Required for non-text payloads");
    println!("    text/plain bodies are sent as text, anything else as media");
    println!("  GET  /health                Liveness check");
    println!();
    println!("Environment:");
    println!("  COURIER_PASSWORD            Account password (required)");
    println!("  COURIER_API_KEY             Shared secret for the ingestion API");
    println!("  RUST_LOG                    Set log level (e.g., info, debug)");
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].clone())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let show_help = args.iter().any(|a| a == "--help" || a == "-h");
    let serve_mode = args.iter().any(|a| a == "--serve" || a == "-s");

    if show_help {
        print_usage();
        return;
    }
    if !serve_mode {
        print_usage();
        println!();
        println!("💡 Run with --serve to start the gateway");
        return;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let homeserver = arg_value(&args, "--homeserver").unwrap_or_else(|| {
        eprintln!("Error: --homeserver is required");
        std::process::exit(1);
    });
    let user_id = arg_value(&args, "--user").unwrap_or_else(|| {
        eprintln!("Error: --user is required");
        std::process::exit(1);
    });
    let port: u16 = arg_value(&args, "--port")
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let mut config = GatewayConfig::new(homeserver, user_id, password_from_env());

    if let Some(channel) = arg_value(&args, "--management") {
        config = config.with_management_channel(channel);
    }
    if let Some(path) = arg_value(&args, "--db-path") {
        config = config.with_db_path(PathBuf::from(path));
    }
    if let Some(name) = arg_value(&args, "--device-name") {
        config = config.with_device_name(name);
    }
    if let Some(n) = arg_value(&args, "--max-retries").and_then(|v| v.parse().ok()) {
        config = config.with_max_retry_attempts(n);
    }
    if let Some(ms) = arg_value(&args, "--base-backoff-ms").and_then(|v| v.parse().ok()) {
        config = config.with_base_backoff_ms(ms);
    }
    if let Some(ms) = arg_value(&args, "--max-backoff-ms").and_then(|v| v.parse().ok()) {
        config = config.with_max_backoff_ms(ms);
    }
    if let Ok(key) = env::var("COURIER_API_KEY") {
        config = config.with_api_key(key);
    }

    println!("Courier Notification Gateway v0.1.0");
    println!();
    println!("Starting gateway...");

    let gateway = match Gateway::start(config).await {
        Ok(g) => Arc::new(g),
        Err(e) => {
            eprintln!("❌ Failed to start gateway: {}", e);
            return;
        }
    };

    println!();
    println!("=== Gateway Identity ===");
    println!("Account: {}", gateway.user_id().await);
    if let Some(channel) = &gateway.config().management_channel {
        println!("Management channel: {}", channel);
    } else {
        println!("Management channel: none (recipient-less deliveries rejected)");
    }

    println!();
    println!("🚀 Courier running");
    println!("📡 Ingestion: http://0.0.0.0:{}/notify", port);
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let server_handle = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            http::run_ingest_server(gateway, port).await;
        })
    };

    let _ = tokio::signal::ctrl_c().await;
    println!();
    info!("Received shutdown signal");

    // Cleanup
    server_handle.abort();

    println!("Shutting down...");
    gateway.stop().await;
    println!("✅ Done");
}
