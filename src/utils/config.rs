#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use log::{error, info, LevelFilter};
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::{env, fs};

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

// SBS Utilities
use crate::utils::errors::Errors;
use crate::utils::locks::{open_lock_store, LockStore};
use crate::utils::payments::PaymentVerifier;
use crate::utils::sbs_utils::get_absolute_path;
use crate::utils::db_init;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// File locations relative to the root directory unless otherwise noted.
pub const SBS_ROOT_DIR: &str = "~/.sbs";
const ENV_LOG4RS_FILE_KEY: &str = "SBS_LOG4RS_CONFIG_FILE";
const LOG4RS_CONFIG_FILE: &str = "/resources/log4rs.yml";
const ENV_CONFIG_FILE_KEY: &str = "SBS_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "/sbs.toml"; // relative to root dir
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 3000;
const DEFAULT_DATABASE_URL: &str = "sqlite://~/.sbs/sbs.db";
const DEFAULT_LOCK_STORE_URL: &str = "memory";
const DEFAULT_LOCK_TTL_SECONDS: u64 = 120;
const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TENANT_SECRET_HASH_COST: u32 = 10;
const DEFAULT_JANITOR_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 10;
const DEFAULT_CURRENCY: &str = "USD";

// Database constants.
pub const SQLITE_TRUE: i64 = 1;
#[allow(dead_code)]
pub const SQLITE_FALSE: i64 = 0;

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
/** The process-wide runtime state: parsed configuration plus the adapter
 * handles the engine needs.  Constructed once at startup, passed into the
 * API structs by reference counting, and closed on shutdown.
 */
pub struct RuntimeCtx {
    pub parms: Parms,
    pub db: Pool<Sqlite>,
    pub locks: Arc<dyn LockStore>,
    pub verifier: PaymentVerifier,
}

impl std::fmt::Debug for RuntimeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeCtx").field("parms", &self.parms).finish()
    }
}

impl RuntimeCtx {
    /// Initialize the full runtime context.  Failures here abort startup.
    pub async fn init() -> Result<Arc<RuntimeCtx>> {
        let parms = get_parms()?;
        let db = db_init::init_db(&parms.config.database_url).await?;
        let locks = open_lock_store(&parms.config.lock_store_url).await?;
        let verifier = PaymentVerifier::new(&parms.config.payment);
        Ok(Arc::new(RuntimeCtx { parms, db, locks, verifier }))
    }

    /// The configured lock TTL.
    pub fn lock_ttl_seconds(&self) -> u64 {
        self.parms.config.lock_ttl_seconds
    }

    /// The bounded deadline applied to adapter calls.
    pub fn adapter_timeout_ms(&self) -> u64 {
        self.parms.config.adapter_timeout_ms
    }
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub database_url: String,
    pub lock_store_url: String,
    pub lock_ttl_seconds: u64,
    pub adapter_timeout_ms: u64,
    pub user_token_secret: String,
    pub tenant_secret_hash_cost: u32,
    pub allowed_origins_default: Vec<String>,
    pub janitor_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub seed_dev_data: bool,
    pub payment: PaymentConfig,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "SBS Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            lock_store_url: DEFAULT_LOCK_STORE_URL.to_string(),
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            adapter_timeout_ms: DEFAULT_ADAPTER_TIMEOUT_MS,
            user_token_secret: "change-me-in-production".to_string(),
            tenant_secret_hash_cost: DEFAULT_TENANT_SECRET_HASH_COST,
            allowed_origins_default: vec!["*".to_string()],
            janitor_interval_seconds: DEFAULT_JANITOR_INTERVAL_SECONDS,
            shutdown_grace_seconds: DEFAULT_SHUTDOWN_GRACE_SECONDS,
            seed_dev_data: false,
            payment: PaymentConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// PaymentConfig:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub mode: PaymentMode,
    pub shared_secret: String,
    pub gateway_url: String,
    pub gateway_key: String,
    pub currency: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            mode: PaymentMode::Simulated,
            shared_secret: String::new(),
            gateway_url: String::new(),
            gateway_key: "gw-dev".to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMode {
    Simulated,
    Reference,
    SignedCallback,
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the YAML file named by the environment or the
 * default location.  When no file is present, fall back to a console
 * appender at INFO so the server still logs somewhere sensible.
 */
pub fn init_log() {
    let logconfig = init_log_config();
    if std::path::Path::new(&logconfig).exists() {
        match log4rs::init_file(logconfig.clone(), Default::default()) {
            Ok(_) => (),
            Err(e) => {
                println!("{}", e);
                let s = format!("{}", Errors::Log4rsInitialization(logconfig));
                panic!("{}", s);
            }
        }
        info!("Log4rs initialized using: {}", logconfig);
        return;
    }

    // No file; build a console configuration programmatically.
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%dT%H:%M:%S%.3fZ)(utc)} {h({l})} {t} - {m}{n}")))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .expect("Unable to assemble default log configuration");
    if log4rs::init_config(config).is_ok() {
        info!("Log4rs initialized with default console configuration.");
    }
}

// ---------------------------------------------------------------------------
// init_log_config:
// ---------------------------------------------------------------------------
fn init_log_config() -> String {
    env::var(ENV_LOG4RS_FILE_KEY)
        .unwrap_or_else(|_| get_absolute_path(SBS_ROOT_DIR) + LOG4RS_CONFIG_FILE)
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file specified
 * either through an environment variable or as the first (and only) command
 * line argument.  If neither are provided, an attempt is made to use the
 * default file path.  A missing file yields the compiled-in defaults.
 */
pub fn get_parms() -> Result<Parms> {
    // Get the config file path from the environment, command line or default.
    let config_file = env::var(ENV_CONFIG_FILE_KEY).unwrap_or_else(|_| {
        match env::args().nth(1) {
            Some(f) => f,
            None => get_absolute_path(SBS_ROOT_DIR) + DEFAULT_CONFIG_FILE,
        }
    });

    // Read the configuration file.
    let config_file_abs = get_absolute_path(&config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            println!("Unable to read configuration at {}. Using default values.", config_file);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    // Parse the toml configuration.
    let config: Config = match toml::from_str(&contents) {
        Ok(c) => c,
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file_abs), e);
            error!("{}", msg);
            return Result::Err(anyhow!(msg));
        }
    };

    Ok(Parms { config_file: config_file_abs, config })
}
