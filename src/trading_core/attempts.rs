//! Per-pivot entry counter for the session

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::levels::PivotKey;

/// Persisted form of one counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub key: PivotKey,
    pub entries: u32,
}

/// Entries taken per pivot/side; only ENTERED transitions count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptLedger {
    counts: BTreeMap<PivotKey, u32>,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[AttemptRecord]) -> Self {
        let mut ledger = Self::new();
        for record in records {
            // Duplicate keys can only come from a hand-edited file; keep the larger count
            let slot = ledger.counts.entry(record.key.clone()).or_insert(0);
            *slot = (*slot).max(record.entries);
        }
        ledger
    }

    pub fn used(&self, key: &PivotKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Count one entry, returns the new total
    pub fn record_entry(&mut self, key: &PivotKey) -> u32 {
        let slot = self.counts.entry(key.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.counts
            .iter()
            .map(|(key, entries)| AttemptRecord {
                key: key.clone(),
                entries: *entries,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::levels::Direction;

    fn key(symbol: &str, cents: i64) -> PivotKey {
        PivotKey {
            symbol: symbol.to_string(),
            pivot_cents: cents,
            direction: Direction::Long,
        }
    }

    #[test]
    fn test_counts_per_key() {
        let mut ledger = AttemptLedger::new();
        assert_eq!(ledger.record_entry(&key("AAPL", 5000)), 1);
        assert_eq!(ledger.record_entry(&key("AAPL", 5000)), 2);
        assert_eq!(ledger.record_entry(&key("AAPL", 5100)), 1);
        assert_eq!(ledger.used(&key("AAPL", 5000)), 2);
        assert_eq!(ledger.used(&key("MSFT", 5000)), 0);
    }

    #[test]
    fn test_records_restore_exactly() {
        let mut ledger = AttemptLedger::new();
        ledger.record_entry(&key("AAPL", 5000));
        ledger.record_entry(&key("TSLA", 20000));
        ledger.record_entry(&key("TSLA", 20000));

        let restored = AttemptLedger::from_records(&ledger.records());
        assert_eq!(restored, ledger);
    }
}
