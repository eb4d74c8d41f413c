use chrono::{NaiveDate, Utc};
use clap::Parser;
use quantflow::config::Settings;
use quantflow::store::PostgresStore;
use quantflow::synthetic::{MarketScenario, SyntheticBars};

/// Seed daily bars for dry runs against a local database.
#[derive(Parser)]
#[command(name = "seed_synthetic")]
struct Args {
    /// Symbols to generate, comma separated
    #[arg(long, value_delimiter = ',', default_value = "SPY,QQQ,TLT,GLD")]
    symbols: Vec<String>,

    /// uptrend, downtrend, sideways, volatile or drawdown
    #[arg(long, default_value = "uptrend")]
    scenario: MarketScenario,

    /// Last bar date (defaults to today)
    #[arg(long)]
    end: Option<NaiveDate>,

    #[arg(long, default_value_t = 300)]
    days: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = "config/quantflow")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::load_from(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .init();

    let store = PostgresStore::connect(&settings.database_url).await?;
    let end = args.end.unwrap_or_else(|| Utc::now().date_naive());

    println!("\n🌱 Seeding {} days of {:?} bars ending {}", args.days, args.scenario, end);
    for (i, symbol) in args.symbols.iter().enumerate() {
        // One seed per symbol so series are not identical
        let mut generator = SyntheticBars::new(args.seed + i as u64)
            .with_base_price(50.0 + 50.0 * (i as f64 + 1.0));
        let bars = generator.generate(symbol, args.scenario, end, args.days);
        let saved = store.upsert_bars(&bars).await?;

        let first = bars.first().map(|b| b.close).unwrap_or_default();
        let last = bars.last().map(|b| b.close).unwrap_or_default();
        println!(
            "  {:<6} {:>4} bars  {:>9.2} → {:>9.2}",
            symbol, saved, first, last
        );
    }

    println!("\n✅ Done. Publish a batch with: quantflow emit-bars --date {} --symbols {}", end, args.symbols.join(","));
    Ok(())
}
