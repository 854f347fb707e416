use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use utoipa::ToSchema;

use crate::models::Reading;

/// Latest reading of a meter together with its poll history
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MeterEntry {
    pub reading: Reading,
    /// When the meter last answered with at least one value
    pub last_success: Option<DateTime<Utc>>,
    /// Failed polls since the last good one
    pub consecutive_failures: u32,
}

/// DataStore keeps the latest reading per meter address.
///
/// Entries are always replaced as a whole and handed out as copies, so a
/// reader never sees half of a poll. The lock is only held for the map
/// operation itself and has nothing to do with the bus lock.
#[derive(Default)]
pub struct DataStore {
    entries: RwLock<HashMap<u8, MeterEntry>>,
}

impl DataStore {
    pub fn new() -> Self {
        return DataStore {
            entries: RwLock::new(HashMap::new()),
        };
    }

    /// Replace the entry of `address` and return the new entry
    pub fn put(&self, address: u8, reading: Reading) -> MeterEntry {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let (last_success, failures) = match entries.get(&address) {
            Some(prev) => (prev.last_success, prev.consecutive_failures),
            None => (None, 0),
        };

        let entry = if reading.ok {
            MeterEntry {
                last_success: Some(reading.timestamp),
                consecutive_failures: 0,
                reading,
            }
        } else {
            MeterEntry {
                last_success,
                consecutive_failures: failures.saturating_add(1),
                reading,
            }
        };

        entries.insert(address, entry.clone());
        return entry;
    }

    pub fn get(&self, address: u8) -> Option<Reading> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        return entries.get(&address).map(|e| e.reading.clone());
    }

    /// Copy of every current reading, ordered by meter address
    pub fn get_all(&self) -> Vec<Reading> {
        return self.entries().into_iter().map(|e| e.reading).collect();
    }

    pub fn entry(&self, address: u8) -> Option<MeterEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        return entries.get(&address).cloned();
    }

    pub fn entries(&self) -> Vec<MeterEntry> {
        let mut all: Vec<MeterEntry> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.values().cloned().collect()
        };
        all.sort_by_key(|e| e.reading.meter_address);
        return all;
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
