use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::tools::ToolSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // Server bind address
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // LLM configuration (Ollama-compatible chat API)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // System preamble seeded into every new conversation. The rendered tool
    // manifest is appended to this at startup.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // Conversation limits
    #[serde(default = "default_context_window_messages")]
    pub context_window_messages: usize,
    #[serde(default = "default_max_conversation_length")]
    pub max_conversation_length: usize,

    // Session lifecycle
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // Ceiling on a single generation request; elapsed time past this is
    // surfaced as a stream failure.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    // Tool manifest + risk classification. Tools not listed here (or listed
    // with `safe = false`) require an explicit confirmation before running.
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolSpec>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant with access to various tools. \
     You can browse the web, read and write files, and execute system commands. \
     Always ask for confirmation before performing potentially dangerous operations."
        .to_string()
}

fn default_context_window_messages() -> usize {
    10
}

fn default_max_conversation_length() -> usize {
    100
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::safe("web_search", "Search the web for a query"),
        ToolSpec::safe("read_file", "Read a file from the sandbox"),
        ToolSpec::safe("list_files", "List files in a sandbox directory"),
        ToolSpec::unsafe_tool("write_file", "Write content to a sandbox file"),
        ToolSpec::unsafe_tool("delete_file", "Delete a file from the sandbox"),
        ToolSpec::unsafe_tool("system_command", "Execute an allowed shell command"),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            context_window_messages: default_context_window_messages(),
            max_conversation_length: default_max_conversation_length(),
            session_timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            tools: default_tools(),
        }
    }
}

impl ServerConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("confab_config.toml")
    }

    /// Load config from confab_config.toml, falling back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ServerConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply environment variable overrides on top of defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = env::var("CONFAB_HOST") {
            config.host = host;
        }

        if let Ok(port) = env::var("CONFAB_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(timeout) = env::var("CONFAB_SESSION_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.session_timeout_secs = seconds;
            }
        }

        if let Ok(length) = env::var("CONFAB_MAX_CONVERSATION_LENGTH") {
            if let Ok(length) = length.parse() {
                config.max_conversation_length = length;
            }
        }

        config
    }
}
