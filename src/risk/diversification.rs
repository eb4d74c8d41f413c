//! Sector and asset-class bucket caps.

use std::collections::{BTreeMap, HashMap};

use super::sizing::WeightedTarget;
use crate::config::params::RiskParams;
use crate::models::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Sector,
    AssetClass,
}

impl Bucket {
    fn label(self) -> &'static str {
        match self {
            Bucket::Sector => "sector",
            Bucket::AssetClass => "asset class",
        }
    }

    fn key(self, instrument: &Instrument) -> Option<&str> {
        match self {
            Bucket::Sector => instrument.sector.as_deref(),
            Bucket::AssetClass => instrument.asset_class.as_deref(),
        }
    }
}

/// Scale every member of an over-cap bucket by `cap / total`.
/// Returns the names of buckets that were scaled.
pub fn apply_bucket_cap(
    targets: &mut [WeightedTarget],
    instruments: &HashMap<String, Instrument>,
    bucket: Bucket,
    cap: f64,
) -> Vec<String> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for target in targets.iter().filter(|t| t.weight != 0.0) {
        match instruments.get(&target.symbol).and_then(|i| bucket.key(i)) {
            Some(name) => *totals.entry(name.to_string()).or_default() += target.weight.abs(),
            None => tracing::warn!(
                symbol = %target.symbol,
                "No {} classification, excluded from diversification caps",
                bucket.label()
            ),
        }
    }

    let mut scaled = Vec::new();
    for (name, total) in totals {
        if total <= cap {
            continue;
        }
        let factor = cap / total;
        let note = format!(
            "{} {} {:.2} > cap {:.2}: x{:.3}",
            bucket.label(),
            name,
            total,
            cap,
            factor
        );
        for target in targets.iter_mut().filter(|t| t.weight != 0.0) {
            if instruments.get(&target.symbol).and_then(|i| bucket.key(i)) == Some(name.as_str()) {
                target.cap(factor, note.clone());
            }
        }
        scaled.push(name);
    }
    scaled
}

/// Sector caps first, then asset-class caps.
pub fn apply_diversification(
    targets: &mut [WeightedTarget],
    instruments: &HashMap<String, Instrument>,
    params: &RiskParams,
) -> Vec<String> {
    let mut scaled = apply_bucket_cap(targets, instruments, Bucket::Sector, params.max_sector_exposure);
    scaled.extend(apply_bucket_cap(
        targets,
        instruments,
        Bucket::AssetClass,
        params.max_asset_class_exposure,
    ));
    scaled
}

/// Aggregate |weight| per bucket, used by callers that verify caps.
pub fn bucket_totals(
    targets: &[WeightedTarget],
    instruments: &HashMap<String, Instrument>,
    bucket: Bucket,
) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for target in targets {
        if let Some(name) = instruments.get(&target.symbol).and_then(|i| bucket.key(i)) {
            *totals.entry(name.to_string()).or_insert(0.0) += target.weight.abs();
        }
    }
    totals
}
