// Risk management module
// Sizing caps, enhancements, diversification, correlation throttle,
// circuit breakers and the kill switch

pub mod circuit_breakers;
pub mod correlation;
pub mod diversification;
pub mod enhancement;
pub mod kill_switch;
pub mod sizing;

pub use circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use kill_switch::{KillSwitch, KillSwitchStore, MemoryKillSwitchStore, RedisKillSwitchStore};
pub use sizing::WeightedTarget;
