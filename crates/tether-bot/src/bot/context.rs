use std::sync::Arc;

use anyhow::Result;
use tether_core::app_server::TurnClient;
use tether_core::config::Config;
use tether_core::coordinator::SessionCoordinator;
use tether_core::types::TurnInput;

pub(crate) struct BotContext {
    coordinator: SessionCoordinator<Arc<dyn TurnClient>>,
    base_instructions: String,
    developer_instructions: String,
}

impl BotContext {
    pub(crate) fn new(
        client: Arc<dyn TurnClient>,
        base_instructions: String,
        developer_instructions: String,
    ) -> Self {
        Self {
            coordinator: SessionCoordinator::new(client),
            base_instructions,
            developer_instructions,
        }
    }

    /// # Errors
    /// Returns an error if the base instructions file cannot be read.
    pub(crate) fn from_config(client: Arc<dyn TurnClient>, config: &Config) -> Result<Self> {
        Ok(Self::new(
            client,
            config.effective_base_instructions()?.unwrap_or_default(),
            config.developer_instructions().unwrap_or_default(),
        ))
    }

    pub(crate) fn coordinator(&self) -> &SessionCoordinator<Arc<dyn TurnClient>> {
        &self.coordinator
    }

    pub(crate) fn turn_input(&self, prompt: &str) -> TurnInput {
        TurnInput::new(
            self.base_instructions.as_str(),
            self.developer_instructions.as_str(),
            prompt,
        )
    }
}
