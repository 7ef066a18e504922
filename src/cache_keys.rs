//! Static cache-key namespace.
//!
//! Maps each watched backend table to the client-side query keys a change to
//! that table makes stale. This is configuration, not discovery: adding a
//! table to the realtime feed means adding a row here.

pub const TRANSACTIONS: &str = "transactions";
pub const TRANSACTION_ITEMS: &str = "transaction-items";
pub const CUSTOMERS: &str = "customers";
pub const LOYALTY_TRANSACTIONS: &str = "loyalty-transactions";
pub const GIFT_CARDS: &str = "gift-cards";
pub const INVENTORY: &str = "inventory";
pub const SERVICES: &str = "services";
pub const SHIFTS: &str = "shifts";
pub const CASH_DRAWER: &str = "cash-drawer";
pub const LOW_STOCK: &str = "low-stock";
pub const DAILY_REVENUE: &str = "daily-revenue";
pub const DAILY_TRANSACTION_COUNT: &str = "daily-transaction-count";
pub const SALES_REPORT: &str = "sales-report";
pub const TOP_ITEMS_REPORT: &str = "top-items-report";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCacheKeys {
    pub table: &'static str,
    /// Key of the cached row collection that realtime events patch in place.
    pub collection: Option<&'static str>,
    /// Keys invalidated (subject to debounce) on any change to the table.
    pub invalidates: &'static [&'static str],
}

pub const TABLE_CACHE_KEYS: &[TableCacheKeys] = &[
    TableCacheKeys {
        table: "transactions",
        collection: Some(TRANSACTIONS),
        invalidates: &[TRANSACTIONS, SALES_REPORT, TOP_ITEMS_REPORT],
    },
    TableCacheKeys {
        table: "transaction_items",
        collection: Some(TRANSACTION_ITEMS),
        invalidates: &[TRANSACTION_ITEMS, TOP_ITEMS_REPORT],
    },
    TableCacheKeys {
        table: "customers",
        collection: Some(CUSTOMERS),
        invalidates: &[CUSTOMERS],
    },
    TableCacheKeys {
        table: "loyalty_transactions",
        collection: Some(LOYALTY_TRANSACTIONS),
        invalidates: &[LOYALTY_TRANSACTIONS, CUSTOMERS],
    },
    TableCacheKeys {
        table: "gift_cards",
        collection: Some(GIFT_CARDS),
        invalidates: &[GIFT_CARDS],
    },
    TableCacheKeys {
        table: "inventory",
        collection: Some(INVENTORY),
        invalidates: &[INVENTORY, LOW_STOCK],
    },
    TableCacheKeys {
        table: "services",
        collection: Some(SERVICES),
        invalidates: &[SERVICES],
    },
    TableCacheKeys {
        table: "shifts",
        collection: Some(SHIFTS),
        invalidates: &[SHIFTS, CASH_DRAWER],
    },
];

/// Aggregates refreshed immediately (no debounce) on a new transaction.
pub const LIVE_DASHBOARD_KEYS: &[&str] = &[DAILY_REVENUE, DAILY_TRANSACTION_COUNT];

/// Aggregates re-validated by the periodic refresher.
pub const REPORT_CACHE_KEYS: &[&str] = &[
    DAILY_REVENUE,
    DAILY_TRANSACTION_COUNT,
    SALES_REPORT,
    TOP_ITEMS_REPORT,
    LOW_STOCK,
];

/// Keys made stale by a drain that submitted at least one sale.
pub const OFFLINE_SYNC_KEYS: &[&str] = &[TRANSACTIONS, LOYALTY_TRANSACTIONS];

pub fn for_table(table: &str) -> Option<&'static TableCacheKeys> {
    TABLE_CACHE_KEYS.iter().find(|t| t.table == table)
}

/// Every table the realtime channel subscribes to.
pub fn watched_tables() -> Vec<&'static str> {
    TABLE_CACHE_KEYS.iter().map(|t| t.table).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_watched_table_has_unique_entry() {
        let tables = watched_tables();
        let mut deduped = tables.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(tables.len(), deduped.len());
        assert!(for_table("transactions").is_some());
        assert!(for_table("unknown_table").is_none());
    }

    #[test]
    fn test_collection_key_is_also_invalidated() {
        for entry in TABLE_CACHE_KEYS {
            if let Some(collection) = entry.collection {
                assert!(
                    entry.invalidates.contains(&collection),
                    "{} does not invalidate its own collection",
                    entry.table
                );
            }
        }
    }
}
