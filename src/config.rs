use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::calendar::DEFAULT_SLOT_MINUTES;
use crate::error::ClinicError;

/// Application-level constants
pub const APP_NAME: &str = "ClinicDesk";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path value that selects an in-memory database.
pub const MEMORY_DATABASE: &str = ":memory:";

/// Runtime settings. Every field has a default. An optional JSON file named by
/// `CLINICDESK_CONFIG` replaces the defaults it mentions; environment
/// variables override both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub gateway_key_secret: String,
    pub webhook_secret: String,
    pub currency: String,
    pub default_opd_fee: Decimal,
    pub emergency_opd_fee: Decimal,
    pub slot_minutes: u32,
    pub invoice_due_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("clinicdesk.db"),
            gateway_key_secret: String::new(),
            webhook_secret: String::new(),
            currency: "INR".to_string(),
            default_opd_fee: Decimal::from(300),
            emergency_opd_fee: Decimal::from(500),
            slot_minutes: DEFAULT_SLOT_MINUTES,
            invoice_due_days: 15,
        }
    }
}

impl Settings {
    /// Load settings from `CLINICDESK_*` environment variables.
    pub fn from_env() -> Result<Self, ClinicError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse a JSON settings document. Missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ClinicError> {
        serde_json::from_str(raw)
            .map_err(|e| ClinicError::InvalidInput(format!("Invalid settings file: {e}")))
    }

    /// Load settings through an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClinicError> {
        let mut settings = match lookup("CLINICDESK_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    ClinicError::InvalidInput(format!("Cannot read settings file {path}: {e}"))
                })?;
                Self::from_json(&raw)?
            }
            None => Settings::default(),
        };

        if let Some(path) = lookup("CLINICDESK_DB") {
            settings.database_path = PathBuf::from(path);
        }
        if let Some(secret) = lookup("CLINICDESK_GATEWAY_SECRET") {
            settings.gateway_key_secret = secret;
        }
        if let Some(secret) = lookup("CLINICDESK_WEBHOOK_SECRET") {
            settings.webhook_secret = secret;
        }
        if let Some(currency) = lookup("CLINICDESK_CURRENCY") {
            settings.currency = currency.trim().to_uppercase();
        }
        if let Some(raw) = lookup("CLINICDESK_SLOT_MINUTES") {
            settings.slot_minutes = parse_number("CLINICDESK_SLOT_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("CLINICDESK_INVOICE_DUE_DAYS") {
            settings.invoice_due_days = parse_number("CLINICDESK_INVOICE_DUE_DAYS", &raw)?;
        }

        if settings.slot_minutes == 0 {
            return Err(ClinicError::InvalidInput(
                "Slot duration must be positive".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn uses_memory_database(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_DATABASE
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ClinicError> {
    raw.trim()
        .parse()
        .map_err(|_| ClinicError::InvalidInput(format!("{key} must be a number, got '{raw}'")))
}
