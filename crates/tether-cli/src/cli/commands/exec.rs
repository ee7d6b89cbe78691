use anyhow::{Context, Result, bail};
use tether_core::config::Config;
use tether_core::types::ConversationKey;

/// Runs one turn and prints the reply as a JSON line. A failed turn still
/// prints its reply before the command exits with an error.
pub async fn run(config: &Config, scope: &str, channel: &str, prompt: &str) -> Result<()> {
    let key = ConversationKey::new(scope, channel);
    tracing::info!(%key, "running single turn");
    let reply = tether_bot::exec(config, &key, prompt).await?;

    println!(
        "{}",
        serde_json::to_string(&reply).context("Failed to encode reply")?
    );

    if reply.status == "error" {
        bail!(
            "turn failed for {key}: {}",
            reply.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
