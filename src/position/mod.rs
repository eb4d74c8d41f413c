//! Position state machine used by the exit rules.
//!
//! Flat ⇄ Long ⇄ Short, with Long ↔ Short reachable directly. Entries and
//! flips happen when the ledger applies a fill; exits force the state to
//! Flat ahead of the closing fill. Reversals signalled by the strategy go
//! through a persistence filter before the optimizer is allowed to act.

use chrono::NaiveDate;

use crate::config::params::ExitParams;
use crate::models::{Direction, PositionState};

/// Quantities smaller than this are treated as no position.
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TrailingStop,
    AtrStop,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::AtrStop => "atr_stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    /// Price level that was crossed.
    pub level: f64,
    pub price: f64,
}

impl ExitTrigger {
    pub fn describe(&self) -> String {
        format!(
            "{}: price {:.2} crossed {:.2}",
            self.reason.as_str(),
            self.price,
            self.level
        )
    }
}

/// Result of running the persistence filter for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Signal agrees with the position, or there is nothing to filter.
    Aligned,
    /// Reversal seen but not yet persisted long enough; hold the position.
    Pending { days: u32, required: u32 },
    /// Reversal persisted; the optimizer may flip.
    Confirmed,
}

impl PositionState {
    pub fn flat(portfolio_id: &str, symbol: &str) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Flat,
            entry_date: None,
            entry_price: None,
            peak_price: None,
            trough_price: None,
            pending_direction: None,
            signal_flip_date: None,
            consecutive_flip_days: 0,
            entry_atr: None,
            last_evaluated: None,
        }
    }

    /// Mark `date` evaluated. Returns false when it already was, so a
    /// redelivered batch leaves the persistence counter alone.
    pub fn begin_evaluation(&mut self, date: NaiveDate) -> bool {
        if self.last_evaluated.is_some_and(|last| last >= date) {
            return false;
        }
        self.last_evaluated = Some(date);
        true
    }

    pub fn is_open(&self) -> bool {
        !self.direction.is_flat()
    }

    /// Reversal waiting on the persistence filter, if any.
    pub fn is_holding_flip(&self, required: u32) -> bool {
        required > 0
            && self.pending_direction.is_some()
            && self.consecutive_flip_days < required
    }

    fn clear_pending(&mut self) {
        self.pending_direction = None;
        self.signal_flip_date = None;
        self.consecutive_flip_days = 0;
    }

    /// Run one persistence evaluation for the strategy's current direction.
    ///
    /// Only reversals (Long ↔ Short) are filtered. The counter grows by one
    /// per evaluation of the same pending direction; any other direction
    /// restarts it at zero.
    pub fn observe_signal(
        &mut self,
        signal: Direction,
        date: NaiveDate,
        required: u32,
    ) -> Persistence {
        if signal == self.direction || signal.is_flat() || self.direction.is_flat() {
            self.clear_pending();
            return Persistence::Aligned;
        }
        if required == 0 {
            self.clear_pending();
            return Persistence::Confirmed;
        }

        match self.pending_direction {
            Some(pending) if pending == signal => {
                self.consecutive_flip_days += 1;
            }
            Some(_) => {
                self.pending_direction = Some(signal);
                self.signal_flip_date = Some(date);
                self.consecutive_flip_days = 0;
            }
            None => {
                self.pending_direction = Some(signal);
                self.signal_flip_date = Some(date);
                self.consecutive_flip_days = 1;
            }
        }

        if self.consecutive_flip_days >= required {
            Persistence::Confirmed
        } else {
            Persistence::Pending {
                days: self.consecutive_flip_days,
                required,
            }
        }
    }

    /// Check the exit rules against the recorded peak/trough, before they
    /// are updated with `price`.
    pub fn check_exit(&self, price: f64, atr: f64, params: &ExitParams) -> Option<ExitTrigger> {
        if !self.is_open() || atr <= 0.0 || !atr.is_finite() {
            return None;
        }
        let sign = self.direction.sign();

        if params.trailing_stop_enabled {
            let distance = params.trailing_atr_multiple * atr;
            let extreme = match self.direction {
                Direction::Long => self.peak_price.or(self.entry_price),
                _ => self.trough_price.or(self.entry_price),
            };
            if let Some(extreme) = extreme {
                let level = extreme - sign * distance;
                if (price - level) * sign <= 0.0 {
                    return Some(ExitTrigger {
                        reason: ExitReason::TrailingStop,
                        level,
                        price,
                    });
                }
            }
        }

        if params.atr_exit_enabled {
            if let Some(entry) = self.entry_price {
                let entry_atr = self.entry_atr.filter(|a| *a > 0.0).unwrap_or(atr);
                let level = entry - sign * params.atr_exit_multiple * entry_atr;
                if (price - level) * sign <= 0.0 {
                    return Some(ExitTrigger {
                        reason: ExitReason::AtrStop,
                        level,
                        price,
                    });
                }
            }
        }

        None
    }

    /// Longs track the running max, shorts the running min.
    pub fn update_extremes(&mut self, price: f64) {
        match self.direction {
            Direction::Long => {
                self.peak_price = Some(self.peak_price.map_or(price, |p| p.max(price)));
            }
            Direction::Short => {
                self.trough_price = Some(self.trough_price.map_or(price, |t| t.min(price)));
            }
            Direction::Flat => {}
        }
    }

    /// Force the position flat after an exit rule fired.
    pub fn force_exit(&mut self) {
        let last_evaluated = self.last_evaluated;
        let (portfolio_id, symbol) = (self.portfolio_id.clone(), self.symbol.clone());
        *self = Self::flat(&portfolio_id, &symbol);
        self.last_evaluated = last_evaluated;
    }

    /// Reconcile with the holding quantity after a fill.
    ///
    /// Entry or flip resets entry fields and the persistence counters; a
    /// fill in the existing direction only moves peak/trough.
    pub fn apply_fill(&mut self, new_qty: f64, price: f64, date: NaiveDate, atr: Option<f64>) {
        let direction = if new_qty.abs() < QTY_EPSILON {
            Direction::Flat
        } else {
            Direction::from_sign(new_qty)
        };

        if direction.is_flat() {
            self.force_exit();
            return;
        }

        if direction != self.direction {
            self.direction = direction;
            self.entry_date = Some(date);
            self.entry_price = Some(price);
            self.peak_price = Some(price);
            self.trough_price = Some(price);
            self.entry_atr = atr;
            self.clear_pending();
        } else {
            self.update_extremes(price);
        }
    }
}
