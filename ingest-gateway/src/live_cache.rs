//! Bounded in-memory history of the latest readings per (location, category).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use telemetry_model::{Category, NormalizedReading};

pub struct LiveCache {
    capacity: usize,
    entries: RwLock<HashMap<(String, Category), VecDeque<NormalizedReading>>>,
}

impl LiveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends under the reading's own key, evicting the oldest entry once
    /// the key holds `capacity` readings.
    pub fn append(&self, reading: &NormalizedReading) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let history = entries
            .entry((reading.location.clone(), reading.category))
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(reading.clone());
    }

    /// Oldest first.
    pub fn get(&self, location: &str, category: Category) -> Vec<NormalizedReading> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(location.to_string(), category))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every category seen at `location`.
    pub fn get_location(&self, location: &str) -> BTreeMap<Category, Vec<NormalizedReading>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((loc, _), _)| loc == location)
            .map(|((_, category), h)| (*category, h.iter().cloned().collect()))
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<Category, Vec<NormalizedReading>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: BTreeMap<String, BTreeMap<Category, Vec<NormalizedReading>>> = BTreeMap::new();
        for ((location, category), history) in entries.iter() {
            out.entry(location.clone())
                .or_default()
                .insert(*category, history.iter().cloned().collect());
        }
        out
    }

    pub fn len(&self, location: &str, category: Category) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(location.to_string(), category))
            .map_or(0, VecDeque::len)
    }
}
