use crate::fs_util::{home_dir, set_secure_dir_permissions, set_secure_file_permissions};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration loaded from TOML, with every field
/// environment-overridable (see [`load`]).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CreditConfig {
    pub gateway: GatewayConfig,
    pub credit: CreditLedgerConfig,
    pub usage: UsageConfig,
    pub ezfp: EzfpConfig,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            credit: CreditLedgerConfig::default(),
            usage: UsageConfig::default(),
            ezfp: EzfpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Admin token required on `/credit/all_logs`, `/credit/models/price`
    /// (PUT), and redemption-code issuance endpoints.
    pub admin_token: Option<String>,
    /// Path to the sqlite database file, or `:memory:`.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            admin_token: None,
            database_path: default_database_path(),
        }
    }
}

fn default_port() -> u16 {
    8800
}
fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_database_path() -> String {
    "credit.sqlite3".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditLedgerConfig {
    /// Local currency units per credit when a payment or redemption code
    /// is converted into balance.
    #[serde(default = "default_exchange_ratio")]
    pub exchange_ratio: Decimal,
    /// Initial balance for a newly seen user.
    #[serde(default)]
    pub default_credit: Decimal,
    /// Message shown (and written into the chat transcript) when a
    /// request is refused for insufficient credit.
    #[serde(default = "default_no_credit_msg")]
    pub no_credit_message: String,
}

impl Default for CreditLedgerConfig {
    fn default() -> Self {
        Self {
            exchange_ratio: default_exchange_ratio(),
            default_credit: Decimal::ZERO,
            no_credit_message: default_no_credit_msg(),
        }
    }
}

fn default_exchange_ratio() -> Decimal {
    Decimal::ONE
}
fn default_no_credit_msg() -> String {
    "Insufficient balance, please top up before continuing.".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageConfig {
    /// Literal prefix stripped from a model id before resolving its
    /// tokenizer encoding (e.g. `"azure/"`).
    #[serde(default)]
    pub model_prefix_to_remove: String,
    /// Model id used to resolve an encoding when the requested model id
    /// is unknown to the tokenizer.
    #[serde(default = "default_encoding_model")]
    pub default_encoding_model: String,
    #[serde(default = "default_token_price")]
    pub default_token_price: Decimal,
    #[serde(default)]
    pub default_request_price: Decimal,
    #[serde(default)]
    pub minimum_cost: Decimal,
    #[serde(default)]
    pub feature_image_generation_price: Decimal,
    #[serde(default)]
    pub feature_code_execute_price: Decimal,
    #[serde(default)]
    pub feature_web_search_price: Decimal,
    #[serde(default)]
    pub feature_tool_server_price: Decimal,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            model_prefix_to_remove: String::new(),
            default_encoding_model: default_encoding_model(),
            default_token_price: default_token_price(),
            default_request_price: Decimal::ZERO,
            minimum_cost: Decimal::ZERO,
            feature_image_generation_price: Decimal::ZERO,
            feature_code_execute_price: Decimal::ZERO,
            feature_web_search_price: Decimal::ZERO,
            feature_tool_server_price: Decimal::ZERO,
        }
    }
}

fn default_encoding_model() -> String {
    "gpt-4o".into()
}
fn default_token_price() -> Decimal {
    Decimal::ZERO
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EzfpConfig {
    pub endpoint: Option<String>,
    pub pid: Option<String>,
    pub key: Option<String>,
    /// `"qrcode"` or `"link"`.
    #[serde(default = "default_pay_priority")]
    pub pay_priority: String,
    pub callback_host: Option<String>,
    /// Comma-separated list of `a-b` ranges or bare values, e.g.
    /// `"1-500,1000"`. `None` means any amount is accepted.
    pub amount_control: Option<String>,
}

impl Default for EzfpConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            pid: None,
            key: None,
            pay_priority: default_pay_priority(),
            callback_host: None,
            amount_control: None,
        }
    }
}

fn default_pay_priority() -> String {
    "qrcode".into()
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `CREDITD_CONFIG` env var
/// 2. `~/.creditd/config.toml`
/// 3. Zero-config defaults (no file needed)
///
/// After loading, environment variables of the same shape as the EZFP and
/// database settings override whatever the file says, then [`validate`]
/// turns misconfiguration into a clear startup error.
pub fn load() -> anyhow::Result<CreditConfig> {
    let path = resolve_path();

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: CreditConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
        info!("loaded config from {}", path.display());
        config
    } else {
        info!("no config file found, using zero-config defaults");
        CreditConfig::default()
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut CreditConfig) {
    if let Ok(v) = std::env::var("EZFP_ENDPOINT") {
        config.ezfp.endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("EZFP_PID") {
        config.ezfp.pid = Some(v);
    }
    if let Ok(v) = std::env::var("EZFP_KEY") {
        config.ezfp.key = Some(v);
    }
    if let Ok(v) = std::env::var("EZFP_PAY_PRIORITY") {
        config.ezfp.pay_priority = v;
    }
    if let Ok(v) = std::env::var("EZFP_CALLBACK_HOST") {
        config.ezfp.callback_host = Some(v);
    }
    if let Ok(v) = std::env::var("EZFP_AMOUNT_CONTROL") {
        config.ezfp.amount_control = Some(v);
    }
    if let Ok(v) = std::env::var("CREDITD_ADMIN_TOKEN") {
        config.gateway.admin_token = Some(v);
    }
    if let Ok(v) = std::env::var("CREDITD_DATABASE_PATH") {
        config.gateway.database_path = v;
    }
}

/// Resolve config file path based on `CREDITD_CONFIG` or `~/.creditd/config.toml`.
pub fn resolve_path() -> PathBuf {
    if let Ok(path) = std::env::var("CREDITD_CONFIG") {
        return PathBuf::from(path);
    }
    let home = home_dir().unwrap_or_else(|_| PathBuf::from("."));
    home.join(".creditd").join("config.toml")
}

/// Save config to the default path with secure permissions.
pub fn save(config: &CreditConfig) -> anyhow::Result<PathBuf> {
    let path = resolve_path();
    save_to_path(config, &path)?;
    Ok(path)
}

/// Save config to an explicit path (used by tests and operator tooling).
pub fn save_to_path(config: &CreditConfig, path: &Path) -> anyhow::Result<()> {
    validate(config)?;
    let content =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("toml encode: {e}"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", parent.display()))?;
        set_secure_dir_permissions(parent)?;
    }

    std::fs::write(path, content)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
    set_secure_file_permissions(path)?;
    Ok(())
}

/// Validate the config and return clear error messages.
fn validate(config: &CreditConfig) -> anyhow::Result<()> {
    if config.credit.exchange_ratio <= Decimal::ZERO {
        anyhow::bail!("credit.exchange_ratio must be > 0");
    }
    if config.credit.default_credit < Decimal::ZERO {
        anyhow::bail!("credit.default_credit must be >= 0");
    }

    let valid_priorities = ["qrcode", "link"];
    if !valid_priorities.contains(&config.ezfp.pay_priority.as_str()) {
        anyhow::bail!(
            "invalid ezfp.pay_priority '{}': must be one of {:?}",
            config.ezfp.pay_priority,
            valid_priorities
        );
    }

    if let Some(control) = &config.ezfp.amount_control {
        for segment in control.split(',') {
            parse_amount_range(segment).map_err(|e| {
                anyhow::anyhow!("invalid ezfp.amount_control segment '{segment}': {e}")
            })?;
        }
    }

    Ok(())
}

/// Parse one `a-b` range or bare value out of an amount-control segment.
pub fn parse_amount_range(segment: &str) -> anyhow::Result<(Decimal, Option<Decimal>)> {
    let segment = segment.trim();
    if let Some((lo, hi)) = segment.split_once('-') {
        let lo: Decimal = lo.trim().parse()?;
        let hi: Decimal = hi.trim().parse()?;
        Ok((lo, Some(hi)))
    } else {
        let value: Decimal = segment.parse()?;
        Ok((value, None))
    }
}
