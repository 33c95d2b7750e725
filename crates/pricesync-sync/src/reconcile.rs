//! Keyed diff between the price feed and the catalog.

use std::collections::HashMap;

use pricesync_core::{
    exceeds_tolerance, parse_price, CatalogProduct, PendingUpdate, PriceEntry, ResourceId,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

/// A matched variant whose catalog price could not be compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonWarning {
    pub product_id: ResourceId,
    pub variant_id: ResourceId,
    pub sku: String,
    pub raw_price: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub feed_skus: usize,
    pub duplicate_feed_skus: usize,
    pub variants_seen: usize,
    pub skipped_no_sku: usize,
    pub unmatched: usize,
    pub unparseable_price: usize,
    pub in_sync: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Catalog order: product order, then variant order.
    pub updates: Vec<PendingUpdate>,
    pub warnings: Vec<ComparisonWarning>,
    pub stats: ReconcileStats,
}

/// `sku -> price`, trimmed keys, last entry wins for repeated SKUs.
pub fn build_lookup(feed: &[PriceEntry]) -> HashMap<String, Decimal> {
    build_lookup_counting(feed).0
}

fn build_lookup_counting(feed: &[PriceEntry]) -> (HashMap<String, Decimal>, usize) {
    let mut lookup = HashMap::with_capacity(feed.len());
    let mut duplicates = 0usize;
    for entry in feed {
        let sku = entry.sku.trim();
        if sku.is_empty() {
            continue;
        }
        if let Some(previous) = lookup.insert(sku.to_string(), entry.price) {
            duplicates += 1;
            if previous != entry.price {
                debug!(sku, %previous, latest = %entry.price, "duplicate feed sku; keeping the later price");
            }
        }
    }
    (lookup, duplicates)
}

pub fn reconcile(feed: &[PriceEntry], catalog: &[CatalogProduct]) -> Reconciliation {
    let (lookup, duplicate_feed_skus) = build_lookup_counting(feed);
    let mut stats = ReconcileStats {
        feed_skus: lookup.len(),
        duplicate_feed_skus,
        ..ReconcileStats::default()
    };
    let mut updates = Vec::new();
    let mut warnings = Vec::new();

    for product in catalog {
        for variant in &product.variants {
            stats.variants_seen += 1;

            let Some(sku) = variant.normalized_sku() else {
                stats.skipped_no_sku += 1;
                continue;
            };
            let Some(&new_price) = lookup.get(sku) else {
                stats.unmatched += 1;
                continue;
            };
            let Some(current_price) = parse_price(&variant.price) else {
                warn!(
                    product_id = %product.id,
                    variant_id = %variant.id,
                    sku,
                    raw_price = %variant.price,
                    "catalog price is not a number; skipping variant"
                );
                stats.unparseable_price += 1;
                warnings.push(ComparisonWarning {
                    product_id: product.id.clone(),
                    variant_id: variant.id.clone(),
                    sku: sku.to_string(),
                    raw_price: variant.price.clone(),
                });
                continue;
            };

            if !exceeds_tolerance(current_price, new_price) {
                stats.in_sync += 1;
                continue;
            }

            updates.push(PendingUpdate {
                product_id: product.id.clone(),
                variant_id: variant.id.clone(),
                sku: sku.to_string(),
                product_title: product.title.clone(),
                variant_title: variant.title.clone(),
                current_price,
                new_price,
                option1: variant.option1.clone(),
                option2: variant.option2.clone(),
                option3: variant.option3.clone(),
            });
        }
    }

    stats.pending = updates.len();
    Reconciliation {
        updates,
        warnings,
        stats,
    }
}

/// Pending updates only.
pub fn diff(feed: &[PriceEntry], catalog: &[CatalogProduct]) -> Vec<PendingUpdate> {
    reconcile(feed, catalog).updates
}
