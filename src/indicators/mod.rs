// Technical indicators module
// ATR, moving averages/channels, volatility and correlation estimators

pub mod atr;
pub mod correlation;
pub mod moving_average;
pub mod volatility;

pub use atr::{atr_or_approximation, calculate_atr, calculate_atr_series, close_to_close_atr};
pub use correlation::{pearson, return_correlation};
pub use moving_average::{calculate_sma, donchian_channel};
pub use volatility::{ewma_annualized_vol, lookback_return, sample_variance, simple_returns};
