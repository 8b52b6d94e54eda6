// =============================================================================
// Shared record types flowing through the pipeline
// =============================================================================
//
// trades  ->  candles  ->  technical indicators
//
// Wire shapes are JSON.  Trades are parsed leniently (the upstream producer
// uses `product_id` / `quantity` / `timestamp_ms`); candles and indicator
// records are emitted with a fixed field order so that replaying the same
// input yields byte-identical output.
// =============================================================================

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Latest accepted event time: 9999-12-31T23:59:59.999Z.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

// ---------------------------------------------------------------------------
// TradeEvent
// ---------------------------------------------------------------------------

/// Aggressor side of an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "b" => Some(Self::Buy),
            "sell" | "s" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// One executed trade.  Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub pair: String,
    pub price: f64,
    pub volume: f64,
    /// Event time, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
}

impl TradeEvent {
    pub fn new(pair: impl Into<String>, price: f64, volume: f64, timestamp: i64) -> Self {
        Self {
            pair: pair.into(),
            price,
            volume,
            timestamp,
            side: None,
        }
    }

    /// Parse a trade from its JSON payload.
    ///
    /// Accepted shapes:
    /// ```json
    /// { "pair": "BTC/USD", "price": 100.0, "volume": 0.5, "timestamp": 1700000000000 }
    /// { "product_id": "BTC/USD", "price": 100.0, "quantity": 0.5,
    ///   "timestamp": "2025-04-24T11:35:42.856Z", "timestamp_ms": 1745494542856 }
    /// ```
    ///
    /// `timestamp_ms` wins over `timestamp`; a string `timestamp` is read as
    /// RFC 3339.  Non-finite or negative prices/volumes are rejected, as are
    /// event times before the epoch or after [`MAX_TIMESTAMP_MS`].
    pub fn from_json(payload: &[u8]) -> Result<Self, PipelineError> {
        let root: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| PipelineError::Malformed(format!("invalid JSON: {e}")))?;

        let pair = root
            .get("pair")
            .or_else(|| root.get("product_id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::Malformed("missing field pair".into()))?
            .to_string();

        let price = number_field(&root, &["price"])?;
        let volume = number_field(&root, &["volume", "quantity"])?;

        if !price.is_finite() || price <= 0.0 {
            return Err(PipelineError::Malformed(format!("invalid price {price}")));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(PipelineError::Malformed(format!("invalid volume {volume}")));
        }

        let timestamp = parse_timestamp(&root)?;
        if !(0..=MAX_TIMESTAMP_MS).contains(&timestamp) {
            return Err(PipelineError::Malformed(format!("timestamp {timestamp} out of range")));
        }

        let side = root.get("side").and_then(|v| v.as_str()).and_then(Side::parse);

        Ok(Self {
            pair,
            price,
            volume,
            timestamp,
            side,
        })
    }
}

/// Numbers may arrive as JSON numbers or as decimal strings.
fn number_field(root: &serde_json::Value, names: &[&str]) -> Result<f64, PipelineError> {
    let value = names
        .iter()
        .find_map(|n| root.get(*n))
        .ok_or_else(|| PipelineError::Malformed(format!("missing field {}", names[0])))?;

    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| PipelineError::Malformed(format!("field {} is not a valid f64", names[0]))),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| PipelineError::Malformed(format!("failed to parse {}: {s}", names[0]))),
        _ => Err(PipelineError::Malformed(format!(
            "field {} has unexpected JSON type",
            names[0]
        ))),
    }
}

fn parse_timestamp(root: &serde_json::Value) -> Result<i64, PipelineError> {
    if let Some(ms) = root.get("timestamp_ms").and_then(|v| v.as_i64()) {
        return Ok(ms);
    }
    match root.get("timestamp") {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| PipelineError::Malformed("timestamp is not an integer".into())),
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| PipelineError::Malformed(format!("invalid timestamp {s}: {e}"))),
        _ => Err(PipelineError::Malformed("missing field timestamp".into())),
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A sealed OHLCV candle for one `(pair, window)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Zero only for gap-fill candles.
    #[serde(default)]
    pub trade_count: u64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    #[serde(default)]
    pub candle_seconds: u64,
}

impl Candle {
    pub fn is_gap_fill(&self) -> bool {
        self.trade_count == 0
    }
}

// ---------------------------------------------------------------------------
// Indicator output
// ---------------------------------------------------------------------------

/// Value of one indicator: a scalar (moving averages, RSI, ...) or a set of
/// named components (bands, MACD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Scalar(f64),
    Multi(BTreeMap<String, f64>),
}

impl IndicatorValue {
    #[cfg(test)]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Multi(_) => None,
        }
    }

    #[cfg(test)]
    pub fn component(&self, name: &str) -> Option<f64> {
        match self {
            Self::Scalar(_) => None,
            Self::Multi(parts) => parts.get(name).copied(),
        }
    }
}

/// Indicators computed for one pair at the close of one candle.  Indicators
/// whose lookback is not yet satisfied are absent from the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub pair: String,
    pub window_end_ms: i64,
    pub indicators: BTreeMap<String, IndicatorValue>,
}

// ---------------------------------------------------------------------------
// Run mode
// ---------------------------------------------------------------------------

/// Live processing or an isolated historical backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Historical,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Live
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Historical => write!(f, "historical"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "historical" => Ok(Self::Historical),
            other => Err(PipelineError::Config(format!("unknown run mode {other}"))),
        }
    }
}
