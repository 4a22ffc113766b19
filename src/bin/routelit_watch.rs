//! routelit-watch
//!
//! Headless driver for a RouteLit page: fetches the initial tree, replays a
//! list of clicks and prints every tree the session sees.
//!
//! Usage:
//!   cargo run --features cli --bin routelit-watch -- \
//!     --url http://localhost:8000/ \
//!     --click submit-btn \
//!     --data name=alice
//!
//!   # Clicks inside a fragment mounted at [2, 0]
//!   cargo run --features cli --bin routelit-watch -- \
//!     --url http://localhost:8000/ \
//!     --fragment counter --fragment-address 2,0 \
//!     --click increment --click increment

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use url::Url;

use routelit_client::{
    ClientConfig, ConfigError, HttpTransport, MemoryHost, SessionManager, UiEventPayload,
};

/// Watch a RouteLit page from the command line
#[derive(Parser, Debug)]
#[command(name = "routelit-watch")]
#[command(about = "Drive a RouteLit session headlessly and print tree updates")]
struct Args {
    /// Page URL (falls back to ROUTELIT_URL)
    #[arg(long, env = "ROUTELIT_URL")]
    url: Option<String>,

    /// Component id to click, in order (can be repeated)
    #[arg(long)]
    click: Vec<String>,

    /// Event data sent with every click, as key=value (can be repeated)
    #[arg(long, value_parser = parse_key_val)]
    data: Vec<(String, String)>,

    /// Dispatch clicks through this fragment
    #[arg(long, requires = "fragment_address")]
    fragment: Option<String>,

    /// Address of the fragment, comma separated
    #[arg(long, value_delimiter = ',')]
    fragment_address: Vec<usize>,

    /// Print compact JSON instead of pretty JSON
    #[arg(long)]
    compact: bool,
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let raw_url = args.url.ok_or(ConfigError::Missing("ROUTELIT_URL"))?;
    let url = Url::parse(&raw_url).with_context(|| format!("invalid page url: {}", raw_url))?;

    let config = ClientConfig::from_env()?;
    let transport = Arc::new(HttpTransport::new(config.clone())?);
    let host = Arc::new(MemoryHost::new(url));
    let manager = SessionManager::builder(transport, host.clone())
        .config(config)
        .build();

    let compact = args.compact;
    let _tree = manager.subscribe(move |tree| {
        let rendered = if compact {
            serde_json::to_string(tree.as_ref())
        } else {
            serde_json::to_string_pretty(tree.as_ref())
        };
        match rendered {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::warn!(error = %e, "could not render tree"),
        }
    });
    let _errors = manager.subscribe_error(|e| eprintln!("error: {}", e));

    manager
        .initialize()
        .await
        .context("initial page load failed")?;

    let target = match &args.fragment {
        Some(id) => manager.fragment(id.clone(), args.fragment_address.clone()),
        None => manager.clone(),
    };

    for id in &args.click {
        let mut payload = UiEventPayload::new(id.clone(), "click");
        for (key, value) in &args.data {
            payload = payload.with_data(key.clone(), value.clone());
        }
        if let Err(e) = target.handle_event(payload).await {
            tracing::error!(component = %id, error = %e, "click failed");
        }
    }

    tracing::info!(
        session = %manager.session_id(),
        url = %manager.last_url(),
        history = host.history().len(),
        "done"
    );
    manager.terminate();
    Ok(())
}
