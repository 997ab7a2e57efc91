//! Core domain model and pure discount logic for Dealfeed.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "dealfeed-core";

/// One offer as scraped by a source adapter, before normalization.
///
/// `old_price` and `discount` are `None` when the listing page carried no
/// old-price element or discount badge for the product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOffer {
    pub name: String,
    pub price: String,
    pub old_price: Option<String>,
    pub discount: Option<String>,
}

/// Normalized upsert item handed to the catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferUpdate {
    pub product_name: String,
    pub price: String,
    pub old_price: Option<String>,
    pub discount_percent: i32,
}

/// A named origin system (one retailer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
}

/// Latest observed price/discount snapshot of one product at one source.
///
/// The id is a surrogate key referenced by the delivery ledger; it stays
/// stable when an upsert overwrites the price fields of the same
/// (source, product_name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub source_id: i64,
    pub product_name: String,
    pub price: String,
    pub old_price: Option<String>,
    pub discount_percent: i32,
    pub observed_at: DateTime<Utc>,
}

/// A user's standing request for discounts from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub threshold: i32,
    pub notify_time: NaiveTime,
}

/// Counters surfaced by the ops `stats` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub users: i64,
    pub subscriptions: i64,
    pub deliveries: i64,
}

/// Parses a scraped discount representation into a whole percentage.
///
/// Accepts strings like `"33%"`, `"-33 %"` or `"−25%"` (Unicode minus);
/// the sign and percent mark are stripped and the remainder must be an
/// integer. Anything else yields `None`: absence of a usable discount,
/// never zero and never an error.
pub fn parse_discount_percent(raw: &str) -> Option<i32> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '%' | '-' | '−') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<i32>().ok()
}

/// Parses a user-supplied notification time-of-day (`"HH:MM"`, minute
/// granularity).
pub fn parse_notify_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// Keeps the offers whose discount parses to at least `threshold` percent,
/// in their original order.
///
/// Offers without a discount badge or with an unparseable value are
/// dropped with a logged reason; one bad record never aborts the batch.
pub fn filter_by_threshold(offers: &[RawOffer], threshold: i32) -> Vec<RawOffer> {
    let mut kept = Vec::new();
    for offer in offers {
        let Some(raw) = offer.discount.as_deref() else {
            warn!(product = %offer.name, "offer carries no discount value, skipping");
            continue;
        };
        let Some(percent) = parse_discount_percent(raw) else {
            warn!(product = %offer.name, raw, "unparseable discount value, skipping");
            continue;
        };
        if percent >= threshold {
            kept.push(offer.clone());
        }
    }
    kept
}

/// Threshold predicate over already-normalized catalog rows, used by the
/// notification job on the unseen set.
pub fn filter_entries_by_threshold(
    mut entries: Vec<CatalogEntry>,
    threshold: i32,
) -> Vec<CatalogEntry> {
    entries.retain(|entry| entry.discount_percent >= threshold);
    entries
}

/// Ingestion-side twin of [`filter_by_threshold`]: converts raw offers into
/// upsert items, dropping records whose discount cannot be parsed.
pub fn normalize_offers(offers: &[RawOffer]) -> Vec<OfferUpdate> {
    let mut updates = Vec::with_capacity(offers.len());
    for offer in offers {
        let Some(percent) = offer.discount.as_deref().and_then(parse_discount_percent) else {
            warn!(product = %offer.name, "offer has no parseable discount, not ingested");
            continue;
        };
        updates.push(OfferUpdate {
            product_name: offer.name.clone(),
            price: offer.price.clone(),
            old_price: offer.old_price.clone(),
            discount_percent: percent,
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(name: &str, discount: Option<&str>) -> RawOffer {
        RawOffer {
            name: name.to_string(),
            price: "1990 ₸".to_string(),
            old_price: Some("2990 ₸".to_string()),
            discount: discount.map(str::to_string),
        }
    }

    #[test]
    fn percent_parsing_strips_sign_and_percent_mark() {
        assert_eq!(parse_discount_percent("33%"), Some(33));
        assert_eq!(parse_discount_percent("-33 %"), Some(33));
        assert_eq!(parse_discount_percent("−25%"), Some(25));
        assert_eq!(parse_discount_percent(" 40 "), Some(40));
    }

    #[test]
    fn percent_parsing_rejects_junk_without_panicking() {
        assert_eq!(parse_discount_percent("Нет"), None);
        assert_eq!(parse_discount_percent(""), None);
        assert_eq!(parse_discount_percent("33.5%"), None);
        assert_eq!(parse_discount_percent("up to 70%"), None);
    }

    #[test]
    fn one_malformed_record_does_not_abort_the_batch() {
        let offers = vec![
            offer("kettle", Some("25%")),
            offer("mystery", Some("???")),
            offer("socks", Some("-40%")),
            offer("bread", None),
        ];
        let kept = filter_by_threshold(&offers, 20);
        let names: Vec<_> = kept.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["kettle", "socks"]);
    }

    #[test]
    fn raising_the_threshold_never_adds_items() {
        let offers = vec![
            offer("a", Some("10%")),
            offer("b", Some("25%")),
            offer("c", Some("50%")),
            offer("d", Some("bogus")),
        ];
        let mut previous = filter_by_threshold(&offers, 0);
        for threshold in [10, 20, 30, 50, 60, 100] {
            let current = filter_by_threshold(&offers, threshold);
            assert!(
                current.iter().all(|o| previous.contains(o)),
                "threshold {threshold} produced an item absent at a lower threshold"
            );
            previous = current;
        }
    }

    #[test]
    fn threshold_is_inclusive_at_the_boundary() {
        let offers = vec![offer("A", Some("33%"))];
        assert_eq!(filter_by_threshold(&offers, 30).len(), 1);
        assert_eq!(filter_by_threshold(&offers, 33).len(), 1);
        assert!(filter_by_threshold(&offers, 40).is_empty());
    }

    #[test]
    fn normalization_drops_only_the_unparseable() {
        let offers = vec![
            offer("kept", Some("15%")),
            offer("dropped", Some("n/a")),
            offer("also kept", Some("5%")),
        ];
        let updates = normalize_offers(&offers);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].product_name, "kept");
        assert_eq!(updates[0].discount_percent, 15);
        assert_eq!(updates[1].discount_percent, 5);
    }

    #[test]
    fn entry_filter_preserves_order_and_boundary() {
        let mk = |id: i64, percent: i32| CatalogEntry {
            id,
            source_id: 1,
            product_name: format!("p{id}"),
            price: "100".into(),
            old_price: None,
            discount_percent: percent,
            observed_at: Utc::now(),
        };
        let entries = vec![mk(1, 25), mk(2, 10), mk(3, 20)];
        let kept = filter_entries_by_threshold(entries, 20);
        let ids: Vec<_> = kept.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn notify_time_parsing_accepts_minutes_only() {
        assert_eq!(
            parse_notify_time("09:00"),
            NaiveTime::from_hms_opt(9, 0, 0)
        );
        assert_eq!(
            parse_notify_time(" 23:59 "),
            NaiveTime::from_hms_opt(23, 59, 0)
        );
        assert_eq!(parse_notify_time("9 am"), None);
        assert_eq!(parse_notify_time("25:00"), None);
    }
}
