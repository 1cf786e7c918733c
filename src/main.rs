use clap::Parser;
use llamadesk::client::{ClientConfig, LlmClient};
use llamadesk::session::Session;
use llamadesk::ui;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "llamadesk",
    about = "Terminal chat for a local LLM, with on-demand execution of code blocks"
)]
struct Args {
    /// Base URL of the inference service.
    #[arg(long, env = "LLAMADESK_ENDPOINT", default_value = "http://localhost:11434")]
    endpoint: String,

    /// Model identifier sent with every request.
    #[arg(long, env = "LLAMADESK_MODEL", default_value = "llama2")]
    model: String,

    /// Wall-clock limit for one chat request, in seconds.
    #[arg(long, env = "LLAMADESK_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // The TUI owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let client = LlmClient::new(ClientConfig {
        endpoint: args.endpoint,
        model: args.model,
        timeout: Duration::from_secs(args.timeout_secs),
    })?;
    tracing::debug!(model = client.model(), "client ready");

    let session = Arc::new(Session::new(client));

    ui::run_tui(session)
}
