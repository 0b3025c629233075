//! Configuration management for the interaction orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::bridge::attestation;
use crate::catalog::{EcosystemId, Env, Protocol};
use crate::error::{OrchestratorError, OrchestratorResult};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "INTERACTIONS_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub guardian: GuardianConfig,
    pub database: Option<DatabaseConfig>,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub env: Env,
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,
    #[serde(default = "default_rpc_retry_delay_ms")]
    pub rpc_retry_delay_ms: u64,
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Interactions kept per environment and family
    #[serde(default = "default_retention_cap")]
    pub retention_cap: usize,
    /// Recent transactions scanned when looking for completed work
    #[serde(default = "default_recent_tx_window")]
    pub recent_tx_window: usize,
}

fn default_rpc_max_retries() -> u32 {
    3
}

fn default_rpc_retry_delay_ms() -> u64 {
    1000
}

fn default_confirmation_poll_ms() -> u64 {
    1000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_retention_cap() -> usize {
    crate::state::MAX_STORED_INTERACTIONS
}

fn default_recent_tx_window() -> usize {
    crate::idempotency::MAX_RECENT_TXS
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardianConfig {
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    attestation::DEFAULT_POLL_INTERVAL_MS
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub ecosystem: EcosystemId,
    /// EVM chain id used for transaction signing
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub core_bridge: String,
    pub token_bridge: String,
    /// 32-byte hex emitter of the token bridge; derived from the token
    /// bridge address on EVM chains when absent
    pub emitter_address: Option<String>,
    /// Overrides the guardian retry budget for transfers out of this chain
    pub attestation_retries: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChainConfig {
    /// Minimal config for a chain whose client is registered by the caller
    pub fn new(ecosystem: EcosystemId, core_bridge: &str, token_bridge: &str) -> Self {
        Self {
            ecosystem,
            chain_id: None,
            rpc_urls: Vec::new(),
            core_bridge: core_bridge.to_string(),
            token_bridge: token_bridge.to_string(),
            emitter_address: None,
            attestation_retries: None,
            enabled: true,
        }
    }

    /// Emitter address of the token bridge as guardians index it
    pub fn emitter_address(&self) -> OrchestratorResult<[u8; 32]> {
        match (&self.emitter_address, self.ecosystem.protocol()) {
            (Some(emitter), _) => {
                let bytes = hex::decode(emitter.trim_start_matches("0x")).map_err(|e| {
                    OrchestratorError::Config(format!("invalid emitter address {}: {}", emitter, e))
                })?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    OrchestratorError::Config(format!("emitter address {} is not 32 bytes", emitter))
                })
            }
            (None, Protocol::Evm) => {
                let address = crate::chain::tx::parse_evm_address(&self.token_bridge)
                    .ok_or_else(|| {
                        OrchestratorError::Config(format!(
                            "invalid token bridge address {}",
                            self.token_bridge
                        ))
                    })?;
                let mut emitter = [0u8; 32];
                emitter[12..].copy_from_slice(address.as_bytes());
                Ok(emitter)
            }
            (None, Protocol::Solana) => Err(OrchestratorError::Config(format!(
                "no emitter address configured for {}",
                self.ecosystem
            ))),
        }
    }

    /// Number of guardian polls allowed for transfers out of this chain
    pub fn attestation_budget(&self) -> u32 {
        self.attestation_retries
            .unwrap_or_else(|| attestation::default_budget(self.ecosystem))
    }
}

impl Settings {
    /// Load settings from the file named by `INTERACTIONS_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.orchestrator.retention_cap == 0 {
            anyhow::bail!("Retention cap must be at least 1");
        }

        if self.guardian.rpc_urls.is_empty() {
            anyhow::bail!("No guardian RPC URLs configured");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.core_bridge.is_empty() || chain.token_bridge.is_empty() {
                anyhow::bail!("Chain {} has no bridge addresses configured", name);
            }
            if chain.ecosystem.protocol() == Protocol::Evm {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.chain_id.is_none() {
                    anyhow::bail!("Chain {} has no chain id configured", name);
                }
            }
            if let Err(e) = chain.emitter_address() {
                anyhow::bail!("Chain {}: {}", name, e);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by ecosystem
    pub fn chain(&self, ecosystem: EcosystemId) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.enabled && c.ecosystem == ecosystem)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[orchestrator]
env = "devnet"
rpc_max_retries = 2

[guardian]
rpc_urls = ["https://guardian.example.com"]

[chains.ethereum]
ecosystem = "ethereum"
chain_id = 5
rpc_urls = ["https://rpc.example.com/${ORCH_TEST_RPC_KEY}"]
core_bridge = "0x706abc4E45D419950511e474C7B9Ed348A4a716c"
token_bridge = "0xF890982f9310df57d00f659cf4fd87e65adEd8d7"

[chains.polygon]
ecosystem = "polygon"
chain_id = 80001
rpc_urls = ["https://polygon.example.com"]
core_bridge = "0x0CBE91CF822c73C2315FB05100C2F714765d5c20"
token_bridge = "0x377D55a7928c046E18eEbb61977e714d2a76472a"

[chains.solana]
ecosystem = "solana"
core_bridge = "3u8hJUVTA4jH1wYAyUur7FFZVQ8H635K3tSHHF4ssjQ5"
token_bridge = "DZnkkTmCiFWfYTfT41X3Rd1kDgozqzxWaHqsw6W4x2oe"
emitter_address = "3b26409f8aaded3f5ddca184695aa6a0fa829b0c85caf84856324896d214ca98"
attestation_retries = 20
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn loads_sample_config_with_defaults() {
        env::set_var("ORCH_TEST_RPC_KEY", "secret");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.orchestrator.env, Env::Devnet);
        assert_eq!(settings.orchestrator.rpc_max_retries, 2);
        assert_eq!(settings.orchestrator.retention_cap, 10);
        assert_eq!(settings.orchestrator.recent_tx_window, 1000);
        assert!(settings.database.is_none());

        let eth = settings.chain(EcosystemId::Ethereum).unwrap();
        assert_eq!(eth.rpc_urls[0], "https://rpc.example.com/secret");
        assert_eq!(eth.attestation_budget(), 10);
        let emitter = eth.emitter_address().unwrap();
        assert_eq!(&emitter[..12], &[0u8; 12]);

        assert_eq!(settings.chain(EcosystemId::Polygon).unwrap().attestation_budget(), 150);
        assert_eq!(settings.chain(EcosystemId::Solana).unwrap().attestation_budget(), 20);
    }

    #[test]
    fn rejects_config_without_chains() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"[orchestrator]\nenv = \"local\"\n[guardian]\nrpc_urls = [\"http://localhost:7071\"]\n[chains]\n",
        )
        .unwrap();
        assert!(Settings::load_from(file.path()).is_err());
    }
}
