use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use std::collections::HashMap;

use super::{LedgerCommit, TradingStore};
use crate::data::{FetchDailyBars, FetchFundamentals, FetchMarketContext};
use crate::error::PipelineError;
use crate::models::{
    Bar, Direction, Fill, Fundamentals, Holding, Instrument, MarketContext, Order, OrderStatus,
    PortfolioState, PositionState, Signal, TargetExposure,
};
use crate::Result;

/// Postgres-backed store
pub struct PostgresStore {
    pool: PgPool,
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn num(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn direction(value: i16) -> Result<Direction> {
    Direction::try_from(value as i8).map_err(PipelineError::Data)
}

fn status_names(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn signal_from_row(row: &PgRow) -> Result<Signal> {
    Ok(Signal {
        strategy_version: row.get("strategy_version"),
        symbol: row.get("symbol"),
        date: row.get("date"),
        lookback_return: row.get("lookback_return"),
        annualized_vol: row.get("annualized_vol"),
        direction: direction(row.get("direction"))?,
        raw_target_weight: row.get("raw_target_weight"),
    })
}

fn target_from_row(row: &PgRow) -> TargetExposure {
    TargetExposure {
        portfolio_id: row.get("portfolio_id"),
        date: row.get("date"),
        symbol: row.get("symbol"),
        target_exposure: num(row.get("target_exposure")),
        scaling_factor: row.get("scaling_factor"),
        is_capped: row.get("is_capped"),
        reason: row.get("reason"),
        is_exit: row.get("is_exit"),
    }
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let side: String = row.get("side");
    let order_type: String = row.get("order_type");
    let status: String = row.get("status");
    Ok(Order {
        order_id: row.get("order_id"),
        portfolio_id: row.get("portfolio_id"),
        date: row.get("date"),
        symbol: row.get("symbol"),
        side: side.parse()?,
        qty: num(row.get("qty")),
        order_type: order_type.parse()?,
        status: status.parse()?,
        broker_order_id: row.get("broker_order_id"),
        rejection_reason: row.get("rejection_reason"),
    })
}

fn holding_from_row(row: &PgRow) -> Holding {
    Holding {
        portfolio_id: row.get("portfolio_id"),
        date: row.get("date"),
        symbol: row.get("symbol"),
        qty: num(row.get("qty")),
        cost_basis: num(row.get("cost_basis")),
        market_value: num(row.get("market_value")),
    }
}

fn state_from_row(row: &PgRow) -> PortfolioState {
    PortfolioState {
        portfolio_id: row.get("portfolio_id"),
        date: row.get("date"),
        nav: num(row.get("nav")),
        cash: num(row.get("cash")),
        gross_exposure: row.get("gross_exposure"),
        net_exposure: row.get("net_exposure"),
        realized_pnl: num(row.get("realized_pnl")),
        unrealized_pnl: num(row.get("unrealized_pnl")),
        drawdown: row.get("drawdown"),
        high_water_mark: num(row.get("high_water_mark")),
    }
}

fn position_from_row(row: &PgRow) -> Result<PositionState> {
    let pending: Option<i16> = row.get("pending_direction");
    let flip_days: i32 = row.get("consecutive_flip_days");
    Ok(PositionState {
        portfolio_id: row.get("portfolio_id"),
        symbol: row.get("symbol"),
        direction: direction(row.get("direction"))?,
        entry_date: row.get("entry_date"),
        entry_price: row.get("entry_price"),
        peak_price: row.get("peak_price"),
        trough_price: row.get("trough_price"),
        pending_direction: pending.map(direction).transpose()?,
        signal_flip_date: row.get("signal_flip_date"),
        consecutive_flip_days: flip_days.max(0) as u32,
        entry_atr: row.get("entry_atr"),
        last_evaluated: row.get("last_evaluated"),
    })
}

fn bar_from_row(row: &PgRow) -> Bar {
    let high: Option<Decimal> = row.get("high");
    let low: Option<Decimal> = row.get("low");
    Bar {
        symbol: row.get("symbol"),
        date: row.get("date"),
        open: num(row.get("open")),
        high: high.map(num),
        low: low.map(num),
        close: num(row.get("close")),
        volume: num(row.get("volume")),
    }
}

async fn latest_state<'e, E: PgExecutor<'e>>(
    executor: E,
    portfolio_id: &str,
) -> Result<Option<PortfolioState>> {
    let row = sqlx::query(
        r#"
        SELECT portfolio_id, date, nav, cash, gross_exposure, net_exposure,
               realized_pnl, unrealized_pnl, drawdown, high_water_mark
        FROM portfolio_state
        WHERE portfolio_id = $1
        ORDER BY date DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(portfolio_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.as_ref().map(state_from_row))
}

async fn upsert_holding<'e, E: PgExecutor<'e>>(executor: E, holding: &Holding) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO holdings (portfolio_id, symbol, date, qty, cost_basis, market_value)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (portfolio_id, symbol) DO UPDATE SET
            date = EXCLUDED.date,
            qty = EXCLUDED.qty,
            cost_basis = EXCLUDED.cost_basis,
            market_value = EXCLUDED.market_value
        "#,
    )
    .bind(&holding.portfolio_id)
    .bind(&holding.symbol)
    .bind(holding.date)
    .bind(dec(holding.qty))
    .bind(dec(holding.cost_basis))
    .bind(dec(holding.market_value))
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_position<'e, E: PgExecutor<'e>>(executor: E, state: &PositionState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO position_state (
            portfolio_id, symbol, direction, entry_date, entry_price, peak_price,
            trough_price, pending_direction, signal_flip_date, consecutive_flip_days, entry_atr,
            last_evaluated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (portfolio_id, symbol) DO UPDATE SET
            direction = EXCLUDED.direction,
            entry_date = EXCLUDED.entry_date,
            entry_price = EXCLUDED.entry_price,
            peak_price = EXCLUDED.peak_price,
            trough_price = EXCLUDED.trough_price,
            pending_direction = EXCLUDED.pending_direction,
            signal_flip_date = EXCLUDED.signal_flip_date,
            consecutive_flip_days = EXCLUDED.consecutive_flip_days,
            entry_atr = EXCLUDED.entry_atr,
            last_evaluated = EXCLUDED.last_evaluated,
            updated_at = NOW()
        "#,
    )
    .bind(&state.portfolio_id)
    .bind(&state.symbol)
    .bind(state.direction.as_i8() as i16)
    .bind(state.entry_date)
    .bind(state.entry_price)
    .bind(state.peak_price)
    .bind(state.trough_price)
    .bind(state.pending_direction.map(|d| d.as_i8() as i16))
    .bind(state.signal_flip_date)
    .bind(state.consecutive_flip_days as i32)
    .bind(state.entry_atr)
    .bind(state.last_evaluated)
    .execute(executor)
    .await?;
    Ok(())
}

impl PostgresStore {
    /// Connect to Postgres
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or refresh daily bars
    pub async fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO daily_bars (symbol, date, open, high, low, close, volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (symbol, date) DO UPDATE SET
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume
                "#,
            )
            .bind(&bar.symbol)
            .bind(bar.date)
            .bind(dec(bar.open))
            .bind(bar.high.map(dec))
            .bind(bar.low.map(dec))
            .bind(dec(bar.close))
            .bind(dec(bar.volume))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!("Saved {} bars to Postgres", bars.len());

        Ok(bars.len())
    }

    pub async fn upsert_instrument(&self, instrument: &Instrument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instruments (symbol, sector, asset_class)
            VALUES ($1, $2, $3)
            ON CONFLICT (symbol) DO UPDATE SET
                sector = EXCLUDED.sector,
                asset_class = EXCLUDED.asset_class
            "#,
        )
        .bind(&instrument.symbol)
        .bind(&instrument.sector)
        .bind(&instrument.asset_class)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TradingStore for PostgresStore {
    async fn upsert_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (
                strategy_version, symbol, date, lookback_return,
                annualized_vol, direction, raw_target_weight
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (strategy_version, symbol, date) DO UPDATE SET
                lookback_return = EXCLUDED.lookback_return,
                annualized_vol = EXCLUDED.annualized_vol,
                direction = EXCLUDED.direction,
                raw_target_weight = EXCLUDED.raw_target_weight
            "#,
        )
        .bind(&signal.strategy_version)
        .bind(&signal.symbol)
        .bind(signal.date)
        .bind(signal.lookback_return)
        .bind(signal.annualized_vol)
        .bind(signal.direction.as_i8() as i16)
        .bind(signal.raw_target_weight)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved signal for {} on {}", signal.symbol, signal.date);

        Ok(())
    }

    async fn latest_signal_date(
        &self,
        strategy: &str,
        on_or_before: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let date: Option<NaiveDate> = sqlx::query_scalar(
            "SELECT MAX(date) FROM signals WHERE strategy_version = $1 AND date <= $2",
        )
        .bind(strategy)
        .bind(on_or_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(date)
    }

    async fn signals_for_date(&self, strategy: &str, date: NaiveDate) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_version, symbol, date, lookback_return,
                   annualized_vol, direction, raw_target_weight
            FROM signals
            WHERE strategy_version = $1 AND date = $2
            ORDER BY symbol
            "#,
        )
        .bind(strategy)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signal_from_row).collect()
    }

    async fn latest_signal(
        &self,
        strategy: &str,
        symbol: &str,
        on_or_before: NaiveDate,
    ) -> Result<Option<Signal>> {
        let row = sqlx::query(
            r#"
            SELECT strategy_version, symbol, date, lookback_return,
                   annualized_vol, direction, raw_target_weight
            FROM signals
            WHERE strategy_version = $1 AND symbol = $2 AND date <= $3
            ORDER BY date DESC
            LIMIT 1
            "#,
        )
        .bind(strategy)
        .bind(symbol)
        .bind(on_or_before)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(signal_from_row).transpose()
    }

    async fn target(
        &self,
        portfolio_id: &str,
        date: NaiveDate,
        symbol: &str,
    ) -> Result<Option<TargetExposure>> {
        let row = sqlx::query(
            r#"
            SELECT portfolio_id, date, symbol, target_exposure, scaling_factor,
                   is_capped, reason, is_exit
            FROM target_exposures
            WHERE portfolio_id = $1 AND date = $2 AND symbol = $3
            "#,
        )
        .bind(portfolio_id)
        .bind(date)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(target_from_row))
    }

    async fn upsert_target_if_changed(&self, target: &TargetExposure) -> Result<bool> {
        // Single statement: the conditional DO UPDATE is the change detection,
        // so concurrent same-date writers resolve to last-write-wins and only
        // a real change reports rows_affected = 1.
        let result = sqlx::query(
            r#"
            INSERT INTO target_exposures (
                portfolio_id, date, symbol, target_exposure, scaling_factor,
                is_capped, reason, is_exit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (portfolio_id, date, symbol) DO UPDATE SET
                target_exposure = EXCLUDED.target_exposure,
                scaling_factor = EXCLUDED.scaling_factor,
                is_capped = EXCLUDED.is_capped,
                reason = EXCLUDED.reason,
                is_exit = EXCLUDED.is_exit,
                updated_at = NOW()
            WHERE (target_exposures.target_exposure, target_exposures.is_capped,
                   target_exposures.reason, target_exposures.is_exit)
                  IS DISTINCT FROM
                  (EXCLUDED.target_exposure, EXCLUDED.is_capped,
                   EXCLUDED.reason, EXCLUDED.is_exit)
              AND (NOT target_exposures.is_exit OR EXCLUDED.is_exit)
            "#,
        )
        .bind(&target.portfolio_id)
        .bind(target.date)
        .bind(&target.symbol)
        .bind(dec(target.target_exposure))
        .bind(target.scaling_factor)
        .bind(target.is_capped)
        .bind(&target.reason)
        .bind(target.is_exit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn holdings(&self, portfolio_id: &str) -> Result<Vec<Holding>> {
        let rows = sqlx::query(
            r#"
            SELECT portfolio_id, symbol, date, qty, cost_basis, market_value
            FROM holdings
            WHERE portfolio_id = $1
            ORDER BY symbol
            "#,
        )
        .bind(portfolio_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(holding_from_row).collect())
    }

    async fn holding(&self, portfolio_id: &str, symbol: &str) -> Result<Option<Holding>> {
        let row = sqlx::query(
            r#"
            SELECT portfolio_id, symbol, date, qty, cost_basis, market_value
            FROM holdings
            WHERE portfolio_id = $1 AND symbol = $2
            "#,
        )
        .bind(portfolio_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(holding_from_row))
    }

    async fn latest_portfolio_state(&self, portfolio_id: &str) -> Result<Option<PortfolioState>> {
        latest_state(&self.pool, portfolio_id).await
    }

    async fn portfolio_state_before(
        &self,
        portfolio_id: &str,
        date: NaiveDate,
    ) -> Result<Option<PortfolioState>> {
        let row = sqlx::query(
            r#"
            SELECT portfolio_id, date, nav, cash, gross_exposure, net_exposure,
                   realized_pnl, unrealized_pnl, drawdown, high_water_mark
            FROM portfolio_state
            WHERE portfolio_id = $1 AND date < $2
            ORDER BY date DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(portfolio_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(state_from_row))
    }

    async fn position_states(&self, portfolio_id: &str) -> Result<Vec<PositionState>> {
        let rows = sqlx::query(
            r#"
            SELECT portfolio_id, symbol, direction, entry_date, entry_price, peak_price,
                   trough_price, pending_direction, signal_flip_date,
                   consecutive_flip_days, entry_atr, last_evaluated
            FROM position_state
            WHERE portfolio_id = $1
            ORDER BY symbol
            "#,
        )
        .bind(portfolio_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    async fn position_state(
        &self,
        portfolio_id: &str,
        symbol: &str,
    ) -> Result<Option<PositionState>> {
        let row = sqlx::query(
            r#"
            SELECT portfolio_id, symbol, direction, entry_date, entry_price, peak_price,
                   trough_price, pending_direction, signal_flip_date,
                   consecutive_flip_days, entry_atr, last_evaluated
            FROM position_state
            WHERE portfolio_id = $1 AND symbol = $2
            "#,
        )
        .bind(portfolio_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(position_from_row).transpose()
    }

    async fn save_position_state(&self, state: &PositionState) -> Result<()> {
        upsert_position(&self.pool, state).await
    }

    async fn insert_order(&self, order: &Order) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, portfolio_id, date, symbol, side, qty, order_type, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.portfolio_id)
        .bind(order.date)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(dec(order.qty))
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn order(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, portfolio_id, date, symbol, side, qty, order_type,
                   status, broker_order_id, rejection_reason
            FROM orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn transition_order(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                rejection_reason = COALESCE($4, rejection_reason),
                updated_at = NOW()
            WHERE order_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(order_id)
        .bind(status_names(from))
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_broker_order(&self, order_id: &str, broker_order_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET broker_order_id = $2, updated_at = NOW() WHERE order_id = $1",
        )
        .bind(order_id)
        .bind(broker_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_order_qty(&self, order_id: &str, qty: f64) -> Result<()> {
        sqlx::query("UPDATE orders SET qty = $2, updated_at = NOW() WHERE order_id = $1")
            .bind(order_id)
            .bind(dec(qty))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn orders_with_status(
        &self,
        portfolio_id: &str,
        statuses: &[OrderStatus],
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, portfolio_id, date, symbol, side, qty, order_type,
                   status, broker_order_id, rejection_reason
            FROM orders
            WHERE portfolio_id = $1 AND status = ANY($2)
            ORDER BY created_at
            "#,
        )
        .bind(portfolio_id)
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn cancel_open_orders(&self, portfolio_id: &str, reason: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'CANCELED', rejection_reason = $3, updated_at = NOW()
            WHERE portfolio_id = $1 AND status = ANY($2)
            RETURNING order_id, portfolio_id, date, symbol, side, qty, order_type,
                      status, broker_order_id, rejection_reason
            "#,
        )
        .bind(portfolio_id)
        .bind(status_names(&OrderStatus::PENDING_LIKE))
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn insert_fill(&self, fill: &Fill) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fills (
                fill_id, order_id, date, symbol, side, qty, price, commission, is_estimated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (fill_id) DO NOTHING
            "#,
        )
        .bind(&fill.fill_id)
        .bind(&fill.order_id)
        .bind(fill.date)
        .bind(&fill.symbol)
        .bind(fill.side.as_str())
        .bind(dec(fill.qty))
        .bind(dec(fill.price))
        .bind(dec(fill.commission))
        .bind(fill.is_estimated)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fill(&self, fill_id: &str) -> Result<Option<Fill>> {
        let row = sqlx::query(
            r#"
            SELECT fill_id, order_id, date, symbol, side, qty, price, commission, is_estimated
            FROM fills
            WHERE fill_id = $1
            "#,
        )
        .bind(fill_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let side: String = row.get("side");
        Ok(Some(Fill {
            fill_id: row.get("fill_id"),
            order_id: row.get("order_id"),
            date: row.get("date"),
            symbol: row.get("symbol"),
            side: side.parse()?,
            qty: num(row.get("qty")),
            price: num(row.get("price")),
            commission: num(row.get("commission")),
            is_estimated: row.get("is_estimated"),
        }))
    }

    async fn is_fill_processed(&self, fill_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_fills WHERE fill_id = $1)")
                .bind(fill_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn commit_ledger(&self, commit: &LedgerCommit) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // One ledger writer per portfolio until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&commit.portfolio_id)
            .execute(&mut *tx)
            .await?;

        let marked = sqlx::query(
            "INSERT INTO processed_fills (fill_id) VALUES ($1) ON CONFLICT (fill_id) DO NOTHING",
        )
        .bind(&commit.fill_id)
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::debug!("Fill {} already processed", commit.fill_id);
            return Ok(false);
        }

        let latest = latest_state(&mut *tx, &commit.portfolio_id).await?;
        if latest != commit.based_on {
            tx.rollback().await?;
            return Err(PipelineError::Conflict(format!(
                "portfolio {} changed before fill {} was committed",
                commit.portfolio_id, commit.fill_id
            )));
        }

        for holding in &commit.holdings {
            upsert_holding(&mut *tx, holding).await?;
        }
        if let Some(symbol) = &commit.closed_symbol {
            sqlx::query("DELETE FROM holdings WHERE portfolio_id = $1 AND symbol = $2")
                .bind(&commit.portfolio_id)
                .bind(symbol)
                .execute(&mut *tx)
                .await?;
        }

        upsert_position(&mut *tx, &commit.position).await?;

        let state = &commit.state;
        sqlx::query(
            r#"
            INSERT INTO portfolio_state (
                portfolio_id, date, nav, cash, gross_exposure, net_exposure,
                realized_pnl, unrealized_pnl, drawdown, high_water_mark
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&state.portfolio_id)
        .bind(state.date)
        .bind(dec(state.nav))
        .bind(dec(state.cash))
        .bind(state.gross_exposure)
        .bind(state.net_exposure)
        .bind(dec(state.realized_pnl))
        .bind(dec(state.unrealized_pnl))
        .bind(state.drawdown)
        .bind(dec(state.high_water_mark))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Committed ledger for fill {} (nav {:.2})",
            commit.fill_id,
            state.nav
        );

        Ok(true)
    }

    async fn load_param_overrides(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM strategy_params ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn set_param_override(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_params (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FetchDailyBars for PostgresStore {
    async fn daily_bars(&self, symbol: &str, end: NaiveDate, limit: usize) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, date, open, high, low, close, volume
            FROM daily_bars
            WHERE symbol = $1 AND date <= $2
            ORDER BY date DESC
            LIMIT $3
            "#,
        )
        .bind(symbol)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars: Vec<Bar> = rows.iter().map(bar_from_row).collect();
        bars.reverse();
        Ok(bars)
    }

    async fn latest_close(&self, symbol: &str, on_or_before: NaiveDate) -> Result<Option<f64>> {
        let close: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT close FROM daily_bars
            WHERE symbol = $1 AND date <= $2
            ORDER BY date DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(on_or_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(close.map(num))
    }
}

#[async_trait]
impl FetchFundamentals for PostgresStore {
    async fn fundamentals(&self, symbols: &[String]) -> Result<HashMap<String, Fundamentals>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, market_cap, beta, avg_dollar_volume
            FROM fundamentals
            WHERE symbol = ANY($1)
            "#,
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let f = Fundamentals {
                    symbol: row.get("symbol"),
                    market_cap: row.get("market_cap"),
                    beta: row.get("beta"),
                    avg_dollar_volume: row.get("avg_dollar_volume"),
                };
                (f.symbol.clone(), f)
            })
            .collect())
    }

    async fn instruments(&self, symbols: &[String]) -> Result<HashMap<String, Instrument>> {
        let rows = sqlx::query(
            "SELECT symbol, sector, asset_class FROM instruments WHERE symbol = ANY($1)",
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let i = Instrument {
                    symbol: row.get("symbol"),
                    sector: row.get("sector"),
                    asset_class: row.get("asset_class"),
                };
                (i.symbol.clone(), i)
            })
            .collect())
    }
}

#[async_trait]
impl FetchMarketContext for PostgresStore {
    async fn market_context(&self, date: NaiveDate) -> Result<Option<MarketContext>> {
        let row = sqlx::query(
            r#"
            SELECT date, sentiment, breadth, volatility_index
            FROM market_context
            WHERE date <= $1
            ORDER BY date DESC
            LIMIT 1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MarketContext {
            date: row.get("date"),
            sentiment: row.get("sentiment"),
            breadth: row.get("breadth"),
            volatility_index: row.get("volatility_index"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderType};

    // Note: These tests require a running Postgres instance
    // Run with: DATABASE_URL=... cargo test --lib store::postgres -- --ignored

    async fn connect() -> PostgresStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/quantflow_test".to_string());
        PostgresStore::connect(&url)
            .await
            .expect("Failed to connect to Postgres")
    }

    #[test]
    fn test_decimal_conversion() {
        assert_eq!(num(dec(0.125)), 0.125);
        assert_eq!(num(dec(-1234.5)), -1234.5);
    }

    #[tokio::test]
    #[ignore]
    async fn test_order_uniqueness_and_guarded_transition() {
        let store = connect().await;
        let portfolio = format!("test-{}", uuid::Uuid::new_v4());
        let order = Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            portfolio_id: portfolio.clone(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            qty: 3.5,
            order_type: OrderType::MarketOnOpen,
            status: OrderStatus::New,
            broker_order_id: None,
            rejection_reason: None,
        };

        assert!(store.insert_order(&order).await.unwrap());
        let duplicate = Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            ..order.clone()
        };
        assert!(!store.insert_order(&duplicate).await.unwrap());

        assert!(store
            .transition_order(&order.order_id, &[OrderStatus::New], OrderStatus::PendingExecution, None)
            .await
            .unwrap());
        assert!(!store
            .transition_order(&order.order_id, &[OrderStatus::New], OrderStatus::PendingExecution, None)
            .await
            .unwrap());

        let canceled = store.cancel_open_orders(&portfolio, "test").await.unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].status, OrderStatus::Canceled);
    }
}
