//! Strategy parameter snapshot.
//!
//! Parameters are loaded once into an immutable [`StrategyParams`] value:
//! compiled defaults, then the config file/environment, then typed
//! key/value override rows from the store. Every override is checked
//! against [`PARAM_SPECS`] before it is applied. Running stages read the
//! snapshot through a [`ParamsHandle`], which swaps the whole snapshot on
//! reload so a handler never sees a half-updated parameter set.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::PipelineError;
use crate::models::OrderType;
use crate::risk::CircuitBreakers;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamCategory {
    Signal,
    Risk,
    Enhancement,
    Exit,
    Execution,
    Breakers,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Float { min: f64, max: f64 },
    Int { min: i64, max: i64 },
    Bool,
    Choice(&'static [&'static str]),
    Text,
}

/// Validation and admin metadata for one parameter key.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
    pub category: ParamCategory,
}

const fn float(key: &'static str, min: f64, max: f64, category: ParamCategory) -> ParamSpec {
    ParamSpec {
        key,
        kind: ParamKind::Float { min, max },
        category,
    }
}

const fn int(key: &'static str, min: i64, max: i64, category: ParamCategory) -> ParamSpec {
    ParamSpec {
        key,
        kind: ParamKind::Int { min, max },
        category,
    }
}

const fn flag(key: &'static str, category: ParamCategory) -> ParamSpec {
    ParamSpec {
        key,
        kind: ParamKind::Bool,
        category,
    }
}

pub const CONFIRMATION_CHOICES: &[&str] = &["none", "donchian", "dual_ma", "both"];
pub const ORDER_TYPE_CHOICES: &[&str] = &["market_on_open", "market"];

use ParamCategory::*;

pub const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec {
        key: "signal.strategy_version",
        kind: ParamKind::Text,
        category: Signal,
    },
    int("signal.lookback_days", 5, 504, Signal),
    float("signal.ewma_lambda", 0.5, 0.999, Signal),
    float("signal.target_vol", 0.01, 1.0, Signal),
    float("signal.min_vol", 0.0, 0.05, Signal),
    ParamSpec {
        key: "signal.confirmation",
        kind: ParamKind::Choice(CONFIRMATION_CHOICES),
        category: Signal,
    },
    int("signal.donchian_window", 5, 252, Signal),
    int("signal.fast_ma", 2, 200, Signal),
    int("signal.slow_ma", 5, 400, Signal),
    float("risk.max_gross_exposure", 0.0, 3.0, Risk),
    float("risk.max_position_weight", 0.0, 1.0, Risk),
    float("risk.drawdown_threshold", 0.0, 1.0, Risk),
    float("risk.drawdown_scale", 0.0, 1.0, Risk),
    flag("risk.diversification_enabled", Risk),
    float("risk.max_sector_exposure", 0.0, 3.0, Risk),
    float("risk.max_asset_class_exposure", 0.0, 3.0, Risk),
    flag("risk.correlation_enabled", Risk),
    float("risk.correlation_threshold", 0.0, 1.0, Risk),
    int("risk.correlation_lookback", 10, 252, Risk),
    float("risk.correlation_throttle", 0.0, 1.0, Risk),
    float("risk.min_position_exposure", 0.0, 0.1, Risk),
    flag("enhancement.conviction_enabled", Enhancement),
    float("enhancement.conviction_floor", 0.0, 1.0, Enhancement),
    float("enhancement.conviction_full_return", 0.001, 1.0, Enhancement),
    flag("enhancement.sentiment_enabled", Enhancement),
    float("enhancement.sentiment_strength", 0.0, 1.0, Enhancement),
    flag("enhancement.regime_enabled", Enhancement),
    float("enhancement.regime_min_breadth", 0.0, 1.0, Enhancement),
    float("enhancement.regime_max_vix", 5.0, 100.0, Enhancement),
    float("enhancement.regime_scale", 0.0, 1.0, Enhancement),
    flag("enhancement.quality_enabled", Enhancement),
    float("enhancement.quality_min_market_cap", 0.0, 1e13, Enhancement),
    float("enhancement.quality_max_beta", 0.0, 10.0, Enhancement),
    float("enhancement.quality_min_dollar_volume", 0.0, 1e12, Enhancement),
    float("enhancement.quality_penalty", 0.0, 1.0, Enhancement),
    int("exit.atr_period", 2, 100, Exit),
    flag("exit.trailing_stop_enabled", Exit),
    float("exit.trailing_atr_multiple", 0.1, 20.0, Exit),
    flag("exit.atr_exit_enabled", Exit),
    float("exit.atr_exit_multiple", 0.1, 20.0, Exit),
    int("exit.persistence_days", 0, 30, Exit),
    float("execution.min_notional", 0.0, 1e7, Execution),
    flag("execution.fractional_shares", Execution),
    int("execution.qty_decimals", 0, 9, Execution),
    ParamSpec {
        key: "execution.order_type",
        kind: ParamKind::Choice(ORDER_TYPE_CHOICES),
        category: Execution,
    },
    int("execution.fill_timeout_secs", 1, 600, Execution),
    int("execution.fill_poll_ms", 50, 60_000, Execution),
    flag("execution.allow_short_selling", Execution),
    float("breakers.max_daily_loss_pct", 0.0, 1.0, Breakers),
    float("breakers.max_drawdown_pct", 0.0, 1.0, Breakers),
];

pub fn spec_for(key: &str) -> Option<&'static ParamSpec> {
    PARAM_SPECS.iter().find(|spec| spec.key == key)
}

/// Parsed override value, already checked against its spec.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl ParamSpec {
    pub fn parse(&self, raw: &str) -> Result<ParamValue> {
        let raw = raw.trim();
        let invalid = |why: String| PipelineError::Config(format!("{}: {}", self.key, why));
        match self.kind {
            ParamKind::Float { min, max } => {
                let value: f64 = raw
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not a number", raw)))?;
                if !value.is_finite() || value < min || value > max {
                    return Err(invalid(format!("{} outside [{}, {}]", value, min, max)));
                }
                Ok(ParamValue::Float(value))
            }
            ParamKind::Int { min, max } => {
                let value: i64 = raw
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not an integer", raw)))?;
                if value < min || value > max {
                    return Err(invalid(format!("{} outside [{}, {}]", value, min, max)));
                }
                Ok(ParamValue::Int(value))
            }
            ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(ParamValue::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(ParamValue::Bool(false)),
                _ => Err(invalid(format!("'{}' is not a boolean", raw))),
            },
            ParamKind::Choice(choices) => {
                if choices.contains(&raw) {
                    Ok(ParamValue::Text(raw.to_string()))
                } else {
                    Err(invalid(format!("'{}' not one of {:?}", raw, choices)))
                }
            }
            ParamKind::Text => {
                if raw.is_empty() {
                    Err(invalid("empty value".to_string()))
                } else {
                    Ok(ParamValue::Text(raw.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    None,
    Donchian,
    DualMa,
    Both,
}

impl Confirmation {
    fn from_choice(choice: &str) -> Self {
        match choice {
            "donchian" => Confirmation::Donchian,
            "dual_ma" => Confirmation::DualMa,
            "both" => Confirmation::Both,
            _ => Confirmation::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalParams {
    pub strategy_version: String,
    pub lookback_days: usize,
    pub ewma_lambda: f64,
    pub target_vol: f64,
    /// Annualized vol below this is treated as zero.
    pub min_vol: f64,
    pub confirmation: Confirmation,
    pub donchian_window: usize,
    pub fast_ma: usize,
    pub slow_ma: usize,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            strategy_version: "trend_v1".to_string(),
            lookback_days: 126,
            ewma_lambda: 0.94,
            target_vol: 0.10,
            min_vol: 1e-6,
            confirmation: Confirmation::None,
            donchian_window: 55,
            fast_ma: 50,
            slow_ma: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    pub max_gross_exposure: f64,
    pub max_position_weight: f64,
    pub drawdown_threshold: f64,
    pub drawdown_scale: f64,
    pub diversification_enabled: bool,
    pub max_sector_exposure: f64,
    pub max_asset_class_exposure: f64,
    pub correlation_enabled: bool,
    pub correlation_threshold: f64,
    pub correlation_lookback: usize,
    pub correlation_throttle: f64,
    /// Holdings below this absolute exposure are ignored by the throttle.
    pub min_position_exposure: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_gross_exposure: 1.0,
            max_position_weight: 0.10,
            drawdown_threshold: 0.10,
            drawdown_scale: 0.5,
            diversification_enabled: true,
            max_sector_exposure: 0.40,
            max_asset_class_exposure: 0.80,
            correlation_enabled: true,
            correlation_threshold: 0.85,
            correlation_lookback: 60,
            correlation_throttle: 0.5,
            min_position_exposure: 0.005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementParams {
    pub conviction_enabled: bool,
    pub conviction_floor: f64,
    /// |lookback return| at or above which conviction is full.
    pub conviction_full_return: f64,
    pub sentiment_enabled: bool,
    pub sentiment_strength: f64,
    pub regime_enabled: bool,
    pub regime_min_breadth: f64,
    pub regime_max_vix: f64,
    pub regime_scale: f64,
    pub quality_enabled: bool,
    pub quality_min_market_cap: f64,
    pub quality_max_beta: f64,
    pub quality_min_dollar_volume: f64,
    pub quality_penalty: f64,
}

impl Default for EnhancementParams {
    fn default() -> Self {
        Self {
            conviction_enabled: false,
            conviction_floor: 0.5,
            conviction_full_return: 0.10,
            sentiment_enabled: false,
            sentiment_strength: 0.25,
            regime_enabled: false,
            regime_min_breadth: 0.40,
            regime_max_vix: 30.0,
            regime_scale: 0.5,
            quality_enabled: false,
            quality_min_market_cap: 2e9,
            quality_max_beta: 2.0,
            quality_min_dollar_volume: 1e7,
            quality_penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitParams {
    pub atr_period: usize,
    pub trailing_stop_enabled: bool,
    pub trailing_atr_multiple: f64,
    pub atr_exit_enabled: bool,
    pub atr_exit_multiple: f64,
    /// 0 disables the persistence filter.
    pub persistence_days: u32,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            atr_period: 14,
            trailing_stop_enabled: true,
            trailing_atr_multiple: 3.0,
            atr_exit_enabled: true,
            atr_exit_multiple: 2.0,
            persistence_days: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionParams {
    pub min_notional: f64,
    pub fractional_shares: bool,
    pub qty_decimals: u32,
    pub order_type: OrderType,
    pub fill_timeout_secs: u64,
    pub fill_poll_ms: u64,
    pub allow_short_selling: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            min_notional: 100.0,
            fractional_shares: true,
            qty_decimals: 4,
            order_type: OrderType::MarketOnOpen,
            fill_timeout_secs: 30,
            fill_poll_ms: 1_000,
            allow_short_selling: false,
        }
    }
}

/// Validated, immutable parameter snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub signal: SignalParams,
    pub risk: RiskParams,
    pub enhancement: EnhancementParams,
    pub exit: ExitParams,
    pub execution: ExecutionParams,
    pub breakers: CircuitBreakers,
}

impl StrategyParams {
    /// Apply one key/value override after validating it against its spec.
    pub fn apply_override(&mut self, key: &str, raw: &str) -> Result<()> {
        let spec = spec_for(key)
            .ok_or_else(|| PipelineError::Config(format!("unknown parameter {}", key)))?;
        let value = spec.parse(raw)?;

        match (key, value) {
            ("signal.strategy_version", ParamValue::Text(v)) => self.signal.strategy_version = v,
            ("signal.lookback_days", ParamValue::Int(v)) => self.signal.lookback_days = v as usize,
            ("signal.ewma_lambda", ParamValue::Float(v)) => self.signal.ewma_lambda = v,
            ("signal.target_vol", ParamValue::Float(v)) => self.signal.target_vol = v,
            ("signal.min_vol", ParamValue::Float(v)) => self.signal.min_vol = v,
            ("signal.confirmation", ParamValue::Text(v)) => {
                self.signal.confirmation = Confirmation::from_choice(&v)
            }
            ("signal.donchian_window", ParamValue::Int(v)) => {
                self.signal.donchian_window = v as usize
            }
            ("signal.fast_ma", ParamValue::Int(v)) => self.signal.fast_ma = v as usize,
            ("signal.slow_ma", ParamValue::Int(v)) => self.signal.slow_ma = v as usize,
            ("risk.max_gross_exposure", ParamValue::Float(v)) => self.risk.max_gross_exposure = v,
            ("risk.max_position_weight", ParamValue::Float(v)) => {
                self.risk.max_position_weight = v
            }
            ("risk.drawdown_threshold", ParamValue::Float(v)) => self.risk.drawdown_threshold = v,
            ("risk.drawdown_scale", ParamValue::Float(v)) => self.risk.drawdown_scale = v,
            ("risk.diversification_enabled", ParamValue::Bool(v)) => {
                self.risk.diversification_enabled = v
            }
            ("risk.max_sector_exposure", ParamValue::Float(v)) => {
                self.risk.max_sector_exposure = v
            }
            ("risk.max_asset_class_exposure", ParamValue::Float(v)) => {
                self.risk.max_asset_class_exposure = v
            }
            ("risk.correlation_enabled", ParamValue::Bool(v)) => self.risk.correlation_enabled = v,
            ("risk.correlation_threshold", ParamValue::Float(v)) => {
                self.risk.correlation_threshold = v
            }
            ("risk.correlation_lookback", ParamValue::Int(v)) => {
                self.risk.correlation_lookback = v as usize
            }
            ("risk.correlation_throttle", ParamValue::Float(v)) => {
                self.risk.correlation_throttle = v
            }
            ("risk.min_position_exposure", ParamValue::Float(v)) => {
                self.risk.min_position_exposure = v
            }
            ("enhancement.conviction_enabled", ParamValue::Bool(v)) => {
                self.enhancement.conviction_enabled = v
            }
            ("enhancement.conviction_floor", ParamValue::Float(v)) => {
                self.enhancement.conviction_floor = v
            }
            ("enhancement.conviction_full_return", ParamValue::Float(v)) => {
                self.enhancement.conviction_full_return = v
            }
            ("enhancement.sentiment_enabled", ParamValue::Bool(v)) => {
                self.enhancement.sentiment_enabled = v
            }
            ("enhancement.sentiment_strength", ParamValue::Float(v)) => {
                self.enhancement.sentiment_strength = v
            }
            ("enhancement.regime_enabled", ParamValue::Bool(v)) => {
                self.enhancement.regime_enabled = v
            }
            ("enhancement.regime_min_breadth", ParamValue::Float(v)) => {
                self.enhancement.regime_min_breadth = v
            }
            ("enhancement.regime_max_vix", ParamValue::Float(v)) => {
                self.enhancement.regime_max_vix = v
            }
            ("enhancement.regime_scale", ParamValue::Float(v)) => {
                self.enhancement.regime_scale = v
            }
            ("enhancement.quality_enabled", ParamValue::Bool(v)) => {
                self.enhancement.quality_enabled = v
            }
            ("enhancement.quality_min_market_cap", ParamValue::Float(v)) => {
                self.enhancement.quality_min_market_cap = v
            }
            ("enhancement.quality_max_beta", ParamValue::Float(v)) => {
                self.enhancement.quality_max_beta = v
            }
            ("enhancement.quality_min_dollar_volume", ParamValue::Float(v)) => {
                self.enhancement.quality_min_dollar_volume = v
            }
            ("enhancement.quality_penalty", ParamValue::Float(v)) => {
                self.enhancement.quality_penalty = v
            }
            ("exit.atr_period", ParamValue::Int(v)) => self.exit.atr_period = v as usize,
            ("exit.trailing_stop_enabled", ParamValue::Bool(v)) => {
                self.exit.trailing_stop_enabled = v
            }
            ("exit.trailing_atr_multiple", ParamValue::Float(v)) => {
                self.exit.trailing_atr_multiple = v
            }
            ("exit.atr_exit_enabled", ParamValue::Bool(v)) => self.exit.atr_exit_enabled = v,
            ("exit.atr_exit_multiple", ParamValue::Float(v)) => self.exit.atr_exit_multiple = v,
            ("exit.persistence_days", ParamValue::Int(v)) => self.exit.persistence_days = v as u32,
            ("execution.min_notional", ParamValue::Float(v)) => self.execution.min_notional = v,
            ("execution.fractional_shares", ParamValue::Bool(v)) => {
                self.execution.fractional_shares = v
            }
            ("execution.qty_decimals", ParamValue::Int(v)) => {
                self.execution.qty_decimals = v as u32
            }
            ("execution.order_type", ParamValue::Text(v)) => {
                self.execution.order_type = v.parse()?
            }
            ("execution.fill_timeout_secs", ParamValue::Int(v)) => {
                self.execution.fill_timeout_secs = v as u64
            }
            ("execution.fill_poll_ms", ParamValue::Int(v)) => {
                self.execution.fill_poll_ms = v as u64
            }
            ("execution.allow_short_selling", ParamValue::Bool(v)) => {
                self.execution.allow_short_selling = v
            }
            ("breakers.max_daily_loss_pct", ParamValue::Float(v)) => {
                self.breakers.max_daily_loss_pct = v
            }
            ("breakers.max_drawdown_pct", ParamValue::Float(v)) => {
                self.breakers.max_drawdown_pct = v
            }
            (key, value) => {
                return Err(PipelineError::Config(format!(
                    "parameter {} cannot take {:?}",
                    key, value
                )))
            }
        }

        Ok(())
    }

    /// Build a snapshot from defaults plus override rows.
    pub fn with_overrides<'a, I>(mut self, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, raw) in overrides {
            self.apply_override(key, raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Cross-field checks that single-key bounds cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.signal.fast_ma >= self.signal.slow_ma {
            return Err(PipelineError::Config(format!(
                "signal.fast_ma ({}) must be below signal.slow_ma ({})",
                self.signal.fast_ma, self.signal.slow_ma
            )));
        }
        if self.risk.max_position_weight > self.risk.max_gross_exposure {
            return Err(PipelineError::Config(
                "risk.max_position_weight exceeds risk.max_gross_exposure".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.drawdown_scale) {
            return Err(PipelineError::Config(
                "risk.drawdown_scale must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Bars of history the signal generator needs for one symbol.
    pub fn required_history(&self) -> usize {
        let confirm = match self.signal.confirmation {
            Confirmation::None => 0,
            Confirmation::Donchian => self.signal.donchian_window,
            Confirmation::DualMa => self.signal.slow_ma,
            Confirmation::Both => self.signal.donchian_window.max(self.signal.slow_ma),
        };
        self.signal.lookback_days.max(confirm) + 1
    }
}

/// Shared handle to the current snapshot.
#[derive(Clone)]
pub struct ParamsHandle {
    current: Arc<RwLock<Arc<StrategyParams>>>,
}

impl ParamsHandle {
    pub fn new(params: StrategyParams) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(params))),
        }
    }

    /// Current snapshot. Callers keep the returned `Arc` for the whole
    /// event so parameters cannot change mid-handler.
    pub fn snapshot(&self) -> Arc<StrategyParams> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, params: StrategyParams) {
        let next = Arc::new(params);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_spec_key_is_assignable() {
        let mut params = StrategyParams::default();
        for spec in PARAM_SPECS {
            let raw = match spec.kind {
                ParamKind::Float { min, max } => format!("{}", (min + max) / 2.0),
                ParamKind::Int { min, .. } => format!("{}", min),
                ParamKind::Bool => "true".to_string(),
                ParamKind::Choice(choices) => choices[0].to_string(),
                ParamKind::Text => "trend_v2".to_string(),
            };
            params
                .apply_override(spec.key, &raw)
                .unwrap_or_else(|e| panic!("{} rejected: {}", spec.key, e));
        }
    }

    #[test]
    fn test_override_bounds_are_enforced() {
        let mut params = StrategyParams::default();
        assert!(params.apply_override("risk.max_position_weight", "1.5").is_err());
        assert!(params.apply_override("exit.persistence_days", "-1").is_err());
        assert!(params.apply_override("signal.confirmation", "macd").is_err());
        assert!(params.apply_override("risk.unknown_key", "1").is_err());

        params.apply_override("risk.max_position_weight", "0.2").unwrap();
        assert_eq!(params.risk.max_position_weight, 0.2);
        params.apply_override("signal.confirmation", "both").unwrap();
        assert_eq!(params.signal.confirmation, Confirmation::Both);
    }

    #[test]
    fn test_cross_field_validation() {
        let result = StrategyParams::default()
            .with_overrides([("signal.fast_ma", "120"), ("signal.slow_ma", "100")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_handle_swaps_whole_snapshot() {
        let handle = ParamsHandle::new(StrategyParams::default());
        let before = handle.snapshot();

        let mut next = StrategyParams::default();
        next.execution.min_notional = 250.0;
        handle.replace(next);

        assert_eq!(before.execution.min_notional, 100.0);
        assert_eq!(handle.snapshot().execution.min_notional, 250.0);
    }

    #[test]
    fn test_required_history_tracks_confirmation() {
        let mut params = StrategyParams::default();
        assert_eq!(params.required_history(), 127);
        params.signal.confirmation = Confirmation::DualMa;
        params.signal.slow_ma = 200;
        assert_eq!(params.required_history(), 201);
    }
}
