use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: ChainConfig,
    pub destination: ChainConfig,
    pub signer: SignerConfig,
    pub relayer: RelayerConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// One chain the relayer polls
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Checkpoint key and log label ("source" / "destination")
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    /// Blocks below head before a log is considered final
    pub confirmations: u64,
    /// Maximum block span of a single eth_getLogs query
    pub max_block_range: u64,
    /// How far behind head to start when no checkpoint exists
    pub initial_backfill_blocks: u64,
}

/// How a pending transfer gets released on the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// complete(transferId, signatures, signers) with relayer attestations
    Attested,
    /// payout(transferId, user, amount) with the owner key, no attestation
    Payout,
}

impl CompletionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionMode::Attested => "attested",
            CompletionMode::Payout => "payout",
        }
    }
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "attested" => Ok(CompletionMode::Attested),
            "payout" => Ok(CompletionMode::Payout),
            other => Err(eyre!(
                "COMPLETION_MODE must be 'attested' or 'payout', got '{}'",
                other
            )),
        }
    }
}

/// Key material and attestation policy
#[derive(Clone)]
pub struct SignerConfig {
    /// Attestation keys, one signature each
    pub attestation_keys: Vec<String>,
    /// Key that sends destination transactions (owner key in payout mode)
    pub submitter_key: String,
    /// Minimum distinct signatures per attestation
    pub signature_threshold: usize,
    pub mode: CompletionMode,
}

/// Custom Debug that redacts private keys to prevent accidental log leakage.
impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field(
                "attestation_keys",
                &format!("<{} redacted>", self.attestation_keys.len()),
            )
            .field("submitter_key", &"<redacted>")
            .field("signature_threshold", &self.signature_threshold)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub max_submit_attempts: u32,
    pub resubmit_after_secs: u64,
    pub lease_ttl_secs: u64,
    pub instance_id: String,
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn resubmit_after(&self) -> Duration {
        Duration::from_secs(self.resubmit_after_secs)
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_submit_attempts: default_max_submit_attempts(),
            resubmit_after_secs: default_resubmit_after(),
            lease_ttl_secs: default_lease_ttl(),
            instance_id: default_instance_id(),
        }
    }
}

/// Health/status API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

/// Default functions
fn default_confirmations() -> u64 {
    1
}

fn default_max_block_range() -> u64 {
    2000
}

fn default_initial_backfill() -> u64 {
    1000
}

fn default_signature_threshold() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_max_submit_attempts() -> u32 {
    5
}

fn default_resubmit_after() -> u64 {
    300
}

fn default_lease_ttl() -> u64 {
    60
}

fn default_api_port() -> u16 {
    9090
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "relayer".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Parse a comma-separated list into individual trimmed entries.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_chain(prefix: &str, name: &str) -> Result<ChainConfig> {
        Ok(ChainConfig {
            name: name.to_string(),
            rpc_url: required(&format!("{}_RPC_URL", prefix))?,
            chain_id: required(&format!("{}_CHAIN_ID", prefix))?
                .parse()
                .wrap_err_with(|| format!("{}_CHAIN_ID must be a valid u64", prefix))?,
            bridge_address: required(&format!("{}_BRIDGE_ADDRESS", prefix))?,
            confirmations: optional(&format!("{}_CONFIRMATIONS", prefix))
                .unwrap_or(default_confirmations()),
            max_block_range: optional("MAX_BLOCK_RANGE").unwrap_or(default_max_block_range()),
            initial_backfill_blocks: optional("INITIAL_BACKFILL_BLOCKS")
                .unwrap_or(default_initial_backfill()),
        })
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let source = Self::load_chain("SOURCE", "source")?;
        let destination = Self::load_chain("DEST", "destination")?;

        let mode = match env::var("COMPLETION_MODE") {
            Ok(raw) => raw.parse()?,
            Err(_) => CompletionMode::Attested,
        };

        let signer = SignerConfig {
            attestation_keys: env::var("RELAYER_SIGNER_KEYS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            submitter_key: required("RELAYER_SUBMITTER_KEY")?,
            signature_threshold: optional("SIGNATURE_THRESHOLD")
                .unwrap_or(default_signature_threshold()),
            mode,
        };

        let relayer = RelayerConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS").unwrap_or(default_poll_interval()),
            max_submit_attempts: optional("MAX_SUBMIT_ATTEMPTS")
                .unwrap_or(default_max_submit_attempts()),
            resubmit_after_secs: optional("RESUBMIT_AFTER_SECS")
                .unwrap_or(default_resubmit_after()),
            lease_ttl_secs: optional("LEASE_TTL_SECS").unwrap_or(default_lease_ttl()),
            instance_id: env::var("RELAYER_INSTANCE_ID").unwrap_or_else(|_| default_instance_id()),
        };

        let api = ApiConfig {
            port: optional("API_PORT").unwrap_or(default_api_port()),
        };

        let config = Config {
            database,
            source,
            destination,
            signer,
            relayer,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for chain in [&self.source, &self.destination] {
            if chain.rpc_url.is_empty() {
                return Err(eyre!("{}.rpc_url cannot be empty", chain.name));
            }
            if !is_evm_address(&chain.bridge_address) {
                return Err(eyre!(
                    "{}.bridge_address must be a valid hex address (42 chars with 0x prefix)",
                    chain.name
                ));
            }
            if chain.max_block_range == 0 {
                return Err(eyre!("{}.max_block_range must be positive", chain.name));
            }
        }

        if self.source.name == self.destination.name {
            return Err(eyre!("source and destination chains need distinct names"));
        }

        if !is_private_key(&self.signer.submitter_key) {
            return Err(eyre!(
                "signer.submitter_key must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if self.signer.mode == CompletionMode::Attested {
            if self.signer.signature_threshold == 0 {
                return Err(eyre!("signer.signature_threshold must be at least 1"));
            }
            for (i, key) in self.signer.attestation_keys.iter().enumerate() {
                if !is_private_key(key) {
                    return Err(eyre!(
                        "signer.attestation_keys[{}] must be 66 chars (0x + 64 hex chars)",
                        i
                    ));
                }
            }
            if self.signer.attestation_keys.len() < self.signer.signature_threshold {
                return Err(eyre!(
                    "signature threshold {} exceeds the {} configured attestation keys",
                    self.signer.signature_threshold,
                    self.signer.attestation_keys.len()
                ));
            }
        }

        if self.relayer.poll_interval_ms == 0 {
            return Err(eyre!("relayer.poll_interval_ms must be positive"));
        }

        if self.relayer.max_submit_attempts == 0 {
            return Err(eyre!("relayer.max_submit_attempts must be positive"));
        }

        Ok(())
    }
}

fn is_evm_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn is_private_key(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_1: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_2: &str = "0x0000000000000000000000000000000000000000000000000000000000000002";

    fn chain(name: &str) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
            confirmations: 1,
            max_block_range: 2000,
            initial_backfill_blocks: 1000,
        }
    }

    fn test_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            source: chain("source"),
            destination: chain("destination"),
            signer: SignerConfig {
                attestation_keys: vec![KEY_1.to_string()],
                submitter_key: KEY_1.to_string(),
                signature_threshold: 1,
                mode: CompletionMode::Attested,
            },
            relayer: RelayerConfig::default(),
            api: ApiConfig { port: 9090 },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_confirmations(), 1);
        assert_eq!(default_poll_interval(), 5000);
        assert_eq!(default_signature_threshold(), 1);
        assert_eq!(default_max_submit_attempts(), 5);
        assert_eq!(default_api_port(), 9090);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_address_and_key_validation() {
        let mut config = test_config();
        config.source.bridge_address = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.signer.submitter_key = "0x123".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.signer.attestation_keys = vec!["0xnothex".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_must_fit_keys() {
        let mut config = test_config();
        config.signer.signature_threshold = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threshold 2"), "{}", err);

        config.signer.attestation_keys.push(KEY_2.to_string());
        assert!(config.validate().is_ok());

        config.signer.signature_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payout_mode_needs_no_attestation_keys() {
        let mut config = test_config();
        config.signer.mode = CompletionMode::Payout;
        config.signer.attestation_keys.clear();
        config.signer.signature_threshold = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chain_names_must_differ() {
        let mut config = test_config();
        config.destination.name = "source".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_completion_mode_parse() {
        assert_eq!("attested".parse::<CompletionMode>().unwrap(), CompletionMode::Attested);
        assert_eq!(" Payout ".parse::<CompletionMode>().unwrap(), CompletionMode::Payout);
        assert!("multisig".parse::<CompletionMode>().is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" 0xa , 0xb ,,"), vec!["0xa", "0xb"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let rendered = format!("{:?}", test_config());
        assert!(!rendered.contains(KEY_1));
        assert!(!rendered.contains("postgres://"));
    }
}
