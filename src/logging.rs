//! Structured Logging for the xBridge wallet
//!
//! Provides structured logging with:
//! - JSON output for log aggregation (always on for mainnet)
//! - Correlation IDs tying a spend's selection, signing and broadcast together
//! - Spend, reconcile and recovery event records
//!
//! # Usage
//!
//! ```rust,ignore
//! use xbridge_wallet::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, false)?;
//! tracing::info!(target: "xbridge_wallet::engine", txid = %txid, "broadcast");
//! ```

use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::wallet::ledger::RecoveryStats;
use crate::wallet::types::Conflict;

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Engine-built payments
    Spend,
    /// External PSBT validation and rebuilds
    Reconcile,
    /// Ledger rehydration
    Recovery,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Domain Event Logging
// ============================================================================

/// Outcome of a spend attempt, for `log_spend_event`
#[derive(Debug, Clone, Copy)]
pub struct SpendOutcome<'a> {
    pub amount_sats: u64,
    pub fee_sats: u64,
    pub inputs: usize,
    pub txid: Option<&'a str>,
    /// `(error_code, message)` on failure
    pub error: Option<(&'a str, &'a str)>,
}

/// Log a spend (engine-built or externally declared)
pub fn log_spend_event(
    category: EventCategory,
    event_type: &str,
    correlation_id: &str,
    outcome: SpendOutcome<'_>,
) {
    let success = outcome.error.is_none();
    let level = if success { LogLevel::Info } else { LogLevel::Error };

    let mut event = LogEvent::new(level, category, event_type)
        .with_correlation_id(correlation_id)
        .with_data(serde_json::json!({
            "amount_sats": outcome.amount_sats,
            "fee_sats": outcome.fee_sats,
            "inputs": outcome.inputs,
            "txid": outcome.txid,
            "success": success,
        }));

    if let Some((code, message)) = outcome.error {
        event = event.with_error(code, message);
    }

    if success {
        tracing::info!(target: "xbridge_wallet::spend", "{}", event.to_json());
    } else {
        tracing::error!(target: "xbridge_wallet::spend", "{}", event.to_json());
    }
}

/// Log conflicts found while validating an external PSBT
pub fn log_conflict_event(correlation_id: &str, conflicts: &[Conflict]) {
    let event = LogEvent::new(LogLevel::Warn, EventCategory::Reconcile, "utxo_conflict")
        .with_correlation_id(correlation_id)
        .with_data(serde_json::json!({ "conflicts": conflicts }));

    tracing::warn!(target: "xbridge_wallet::reconcile", "{}", event.to_json());
}

/// Record of one startup recovery pass; `Err` carries the failure message
pub fn recovery_event(
    correlation_id: &str,
    address: &str,
    result: Result<&RecoveryStats, &str>,
) -> LogEvent {
    match result {
        Ok(stats) => LogEvent::new(LogLevel::Info, EventCategory::Recovery, "ledger_recovered")
            .with_correlation_id(correlation_id)
            .with_data(serde_json::json!({
                "address": address,
                "transactions": stats.transactions,
                "spent_inputs": stats.spent_inputs,
                "change_outputs": stats.change_outputs,
            })),
        Err(message) => LogEvent::new(LogLevel::Error, EventCategory::Recovery, "recovery_failed")
            .with_correlation_id(correlation_id)
            .with_data(serde_json::json!({ "address": address }))
            .with_error("CHAIN_ERROR", message),
    }
}

pub fn log_recovery_event(
    correlation_id: &str,
    address: &str,
    result: Result<&RecoveryStats, &str>,
) {
    let failed = result.is_err();
    let event = recovery_event(correlation_id, address, result);

    if failed {
        tracing::error!(target: "xbridge_wallet::recovery", "{}", event.to_json());
    } else {
        tracing::info!(target: "xbridge_wallet::recovery", "{}", event.to_json());
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xbridge_wallet={}", level.as_filter())));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from WalletConfig
pub fn init_from_config(config: &crate::config::WalletConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

// ============================================================================
// Correlation IDs
// ============================================================================

/// Generate a correlation ID for one engine operation
pub fn generate_correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis() as u64;
    format!("{:x}-{:04x}", millis & 0xFFFF_FFFF, rand::random::<u16>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::types::ConflictReason;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Spend, "payment_broadcast")
            .with_correlation_id("abc-0001")
            .with_data(serde_json::json!({"txid": "ff"}));

        let json = event.to_json();
        assert!(json.contains("payment_broadcast"));
        assert!(json.contains("\"category\":\"spend\""));
        assert!(json.contains("abc-0001"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_error_details() {
        let event = LogEvent::new(LogLevel::Error, EventCategory::Spend, "broadcast_failed")
            .with_error("BROADCAST_REJECTED", "min relay fee not met");
        let json = event.to_json();
        assert!(json.contains("BROADCAST_REJECTED"));
        assert!(json.contains("\"level\":\"ERROR\""));
    }

    #[test]
    fn test_recovery_event_payload() {
        let stats = RecoveryStats {
            transactions: 2,
            spent_inputs: 3,
            change_outputs: 1,
        };
        let json = recovery_event("abc-0002", "bcrt1qxyz", Ok(&stats)).to_json();
        assert!(json.contains("\"category\":\"recovery\""));
        assert!(json.contains("\"correlation_id\":\"abc-0002\""));
        assert!(json.contains("\"spent_inputs\":3"));

        let json = recovery_event("abc-0003", "bcrt1qxyz", Err("HTTP error: timeout")).to_json();
        assert!(json.contains("recovery_failed"));
        assert!(json.contains("\"level\":\"ERROR\""));
        assert!(json.contains("HTTP error: timeout"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_conflict_event_payload() {
        let conflicts = vec![Conflict {
            txid: "aa".into(),
            vout: 1,
            reason: ConflictReason::Reserved,
            spent_in_txid: None,
        }];
        let event = LogEvent::new(LogLevel::Warn, EventCategory::Reconcile, "utxo_conflict")
            .with_data(serde_json::json!({ "conflicts": conflicts }));
        assert!(event.to_json().contains("\"reason\":\"reserved\""));
    }

    #[test]
    fn test_correlation_id_shape() {
        let id = generate_correlation_id();
        let (_, suffix) = id.split_once('-').unwrap();
        assert_eq!(suffix.len(), 4);
    }
}
