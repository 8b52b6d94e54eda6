// =============================================================================
// Indicator Registry: static catalogue of supported indicators
// =============================================================================
//
// Indicators are configured by name: `<kind>[_<param>...]`, e.g. `sma_14`,
// `macd_12_26_9`, `bbands_20_2`, `obv`.  A bare kind (`macd`) takes the
// catalogue defaults.  Each parsed name becomes an `IndicatorSpec` holding a
// tagged `IndicatorKind`; there is no dynamic dispatch.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use crate::errors::PipelineError;
use crate::types::{Candle, IndicatorValue};

use super::{atr, bollinger, ema, macd, obv, roc, rsi, sma};

/// Every supported indicator with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorKind {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, num_std: f64 },
    Atr { period: usize },
    Roc { period: usize },
    Obv,
}

impl IndicatorKind {
    /// Number of candles that must be buffered before a value exists.
    pub fn min_lookback(&self) -> usize {
        match *self {
            Self::Sma { period } | Self::Ema { period } | Self::Bollinger { period, .. } => period,
            Self::Rsi { period } | Self::Atr { period } | Self::Roc { period } => period + 1,
            Self::Macd { slow, signal, .. } => slow + signal - 1,
            Self::Obv => 2,
        }
    }

    /// Compute over the buffered candles (oldest first).  `closes` is the
    /// close column of `candles`.
    pub fn compute(&self, candles: &[Candle], closes: &[f64]) -> Option<IndicatorValue> {
        if candles.len() < self.min_lookback() {
            return None;
        }
        match *self {
            Self::Sma { period } => sma::calculate_sma(closes, period).map(IndicatorValue::Scalar),
            Self::Ema { period } => ema::current_ema(closes, period).map(IndicatorValue::Scalar),
            Self::Rsi { period } => rsi::current_rsi(closes, period).map(IndicatorValue::Scalar),
            Self::Macd { fast, slow, signal } => {
                let m = macd::calculate_macd(closes, fast, slow, signal)?;
                Some(multi(&[("macd", m.macd), ("signal", m.signal), ("histogram", m.histogram)]))
            }
            Self::Bollinger { period, num_std } => {
                let b = bollinger::calculate_bollinger(closes, period, num_std)?;
                Some(multi(&[("upper", b.upper), ("middle", b.middle), ("lower", b.lower)]))
            }
            Self::Atr { period } => atr::calculate_atr(candles, period).map(IndicatorValue::Scalar),
            Self::Roc { period } => roc::current_roc(closes, period).map(IndicatorValue::Scalar),
            Self::Obv => obv::calculate_obv(candles).map(IndicatorValue::Scalar),
        }
    }
}

fn multi(parts: &[(&str, f64)]) -> IndicatorValue {
    IndicatorValue::Multi(parts.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>())
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

struct CatalogueEntry {
    prefix: &'static str,
    defaults: &'static [&'static str],
    build: fn(&[&str]) -> Option<IndicatorKind>,
}

static CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry { prefix: "sma", defaults: &["14"], build: build_sma },
    CatalogueEntry { prefix: "ema", defaults: &["14"], build: build_ema },
    CatalogueEntry { prefix: "rsi", defaults: &["14"], build: build_rsi },
    CatalogueEntry { prefix: "macd", defaults: &["12", "26", "9"], build: build_macd },
    CatalogueEntry { prefix: "bbands", defaults: &["20", "2"], build: build_bollinger },
    CatalogueEntry { prefix: "atr", defaults: &["14"], build: build_atr },
    CatalogueEntry { prefix: "roc", defaults: &["10"], build: build_roc },
    CatalogueEntry { prefix: "obv", defaults: &[], build: build_obv },
];

fn period(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|p| *p > 0)
}

fn single(params: &[&str]) -> Option<usize> {
    match params {
        [p] => period(p),
        _ => None,
    }
}

fn build_sma(params: &[&str]) -> Option<IndicatorKind> {
    single(params).map(|period| IndicatorKind::Sma { period })
}

fn build_ema(params: &[&str]) -> Option<IndicatorKind> {
    single(params).map(|period| IndicatorKind::Ema { period })
}

fn build_rsi(params: &[&str]) -> Option<IndicatorKind> {
    single(params).map(|period| IndicatorKind::Rsi { period })
}

fn build_atr(params: &[&str]) -> Option<IndicatorKind> {
    single(params).map(|period| IndicatorKind::Atr { period })
}

fn build_roc(params: &[&str]) -> Option<IndicatorKind> {
    single(params).map(|period| IndicatorKind::Roc { period })
}

fn build_macd(params: &[&str]) -> Option<IndicatorKind> {
    let [fast, slow, signal] = params else {
        return None;
    };
    let (fast, slow, signal) = (period(fast)?, period(slow)?, period(signal)?);
    (fast < slow).then_some(IndicatorKind::Macd { fast, slow, signal })
}

fn build_bollinger(params: &[&str]) -> Option<IndicatorKind> {
    let [p, k] = params else {
        return None;
    };
    let num_std = k.parse::<f64>().ok().filter(|k| k.is_finite() && *k > 0.0)?;
    Some(IndicatorKind::Bollinger {
        period: period(p)?,
        num_std,
    })
}

fn build_obv(params: &[&str]) -> Option<IndicatorKind> {
    params.is_empty().then_some(IndicatorKind::Obv)
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// A configured indicator: its output name plus the parsed kind.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSpec {
    pub name: String,
    pub kind: IndicatorKind,
}

impl IndicatorSpec {
    /// Parse one indicator name.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let name = raw.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(PipelineError::Config("empty indicator name".into()));
        }

        let mut parts = name.split('_');
        let prefix = parts.next().unwrap_or_default();
        let params: Vec<&str> = parts.collect();

        let entry = CATALOGUE
            .iter()
            .find(|e| e.prefix == prefix)
            .ok_or_else(|| PipelineError::Config(format!("unknown indicator {name}")))?;

        let kind = if params.is_empty() {
            (entry.build)(entry.defaults)
        } else {
            (entry.build)(&params)
        }
        .ok_or_else(|| PipelineError::Config(format!("invalid parameters for indicator {name}")))?;

        Ok(Self { name, kind })
    }

    pub fn min_lookback(&self) -> usize {
        self.kind.min_lookback()
    }
}

/// Parse the configured indicator set, rejecting an empty set, unknown names,
/// bad parameters and duplicates.
pub fn parse_set(names: &[String]) -> Result<Vec<IndicatorSpec>, PipelineError> {
    if names.is_empty() {
        return Err(PipelineError::Config("no indicators configured".into()));
    }
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|raw| {
            let spec = IndicatorSpec::parse(raw)?;
            if !seen.insert(spec.name.clone()) {
                return Err(PipelineError::Config(format!("duplicate indicator {}", spec.name)));
            }
            Ok(spec)
        })
        .collect()
}

/// Per-pair history capacity: the largest lookback, but never below `floor`.
pub fn history_capacity(specs: &[IndicatorSpec], floor: usize) -> usize {
    specs
        .iter()
        .map(IndicatorSpec::min_lookback)
        .max()
        .unwrap_or(0)
        .max(floor)
}
