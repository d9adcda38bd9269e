//! Private ledger of split decisions owned by a party

use fedgb_core::{FeatureId, RecordId};
use serde::{Deserialize, Serialize};

/// One split decided by the feature-owning party
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub record_id: RecordId,
    /// Global feature id
    pub feature: FeatureId,
    /// Samples with value <= threshold go left
    pub threshold: f64,
}

/// Append-only table of split records; record ids are 1, 2, 3, ...
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTable {
    entries: Vec<QueryEntry>,
}

impl QueryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<QueryEntry>) -> Self {
        Self { entries }
    }

    /// Append a split and return its record id
    pub fn append(&mut self, feature: FeatureId, threshold: f64) -> RecordId {
        let record_id = self.entries.last().map_or(1, |e| e.record_id + 1);
        self.entries.push(QueryEntry {
            record_id,
            feature,
            threshold,
        });
        record_id
    }

    pub fn get(&self, record_id: RecordId) -> Option<&QueryEntry> {
        let idx = (record_id as usize).checked_sub(1)?;
        self.entries
            .get(idx)
            .filter(|e| e.record_id == record_id)
            .or_else(|| self.entries.iter().find(|e| e.record_id == record_id))
    }

    pub fn entries(&self) -> &[QueryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_sequential_ids() {
        let mut table = QueryTable::new();
        assert_eq!(table.append(3, 0.5), 1);
        assert_eq!(table.append(1, -2.0), 2);
        assert_eq!(table.len(), 2);

        let entry = table.get(2).unwrap();
        assert_eq!(entry.feature, 1);
        assert_eq!(entry.threshold, -2.0);
        assert!(table.get(0).is_none());
        assert!(table.get(3).is_none());
    }
}
