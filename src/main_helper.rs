use clap::Parser;
use std::sync::Arc;

use crate::assistants::AssistantRegistry;
use crate::auth::AuthGate;
use crate::constants::OPENAI_RESPONSES_URL;
use crate::db::ChatStore;
use crate::upstream::ResponsesClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "palaver.db")]
    pub database: String,
    #[arg(long, default_value = OPENAI_RESPONSES_URL)]
    pub upstream_url: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub max_body_size: usize,
}

/// Explicitly constructed dependencies, shared by every handler. Nothing in
/// here is a global; tests assemble their own.
#[derive(Clone)]
pub struct AppState {
    pub upstream: ResponsesClient,
    pub store: ChatStore,
    pub assistants: AssistantRegistry,
    pub auth: AuthGate,
    pub args: Arc<Args>,
}
