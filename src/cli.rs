use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::gateway::Provider;

#[derive(Parser, Debug)]
#[command(name = "roomsync")]
#[command(version)]
#[command(about = "Shared chat and document rooms with an @ai assistant")]
pub struct Args {
    /// TOML config file; every field is optional
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay hub
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8787")]
        bind: String,
    },
    /// Join a room as an interactive terminal participant
    Join(JoinArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct JoinArgs {
    /// Room code
    pub room: Option<String>,

    /// Display name
    #[arg(long, short)]
    pub name: Option<String>,

    /// Hub base URL, e.g. ws://127.0.0.1:8787
    #[arg(long)]
    pub hub: Option<String>,

    /// Assistant provider: gemini or openai
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Assistant model (defaults per provider)
    #[arg(long)]
    pub model: Option<String>,

    /// Quiet period before typing-pause, in milliseconds
    #[arg(long)]
    pub quiet_ms: Option<u64>,
}

impl JoinArgs {
    /// Flags win over file values.
    pub fn apply(&self, cfg: &mut SyncConfig) {
        if let Some(room) = &self.room {
            cfg.room = room.clone();
        }
        if let Some(name) = &self.name {
            cfg.username = name.clone();
        }
        if let Some(hub) = &self.hub {
            cfg.hub_url = hub.clone();
        }
        if let Some(provider) = self.provider {
            if provider != cfg.assistant.provider {
                // Provider-specific defaults must follow the new provider.
                cfg.assistant.model.clear();
                cfg.assistant.api_key_env.clear();
                cfg.assistant.max_output_tokens = None;
            }
            cfg.assistant.provider = provider;
        }
        if let Some(model) = &self.model {
            cfg.assistant.model = model.clone();
        }
        if let Some(ms) = self.quiet_ms {
            cfg.presence.quiet_period_ms = ms;
        }
    }
}

impl Args {
    /// Load the config file (or defaults) without applying flags.
    pub fn load_config(&self) -> Result<SyncConfig> {
        match &self.config {
            Some(path) => SyncConfig::load(path),
            None => Ok(SyncConfig::default()),
        }
    }
}
