//! Per-tracker operation counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    TotalFiles,
    TotalFolders,
    FilesSent,
    FilesReceived,
    FilesDeleted,
    CatalogsSent,
    CatalogsReceived,
}

impl Statistic {
    pub const ALL: [Statistic; 7] = [
        Statistic::TotalFiles,
        Statistic::TotalFolders,
        Statistic::FilesSent,
        Statistic::FilesReceived,
        Statistic::FilesDeleted,
        Statistic::CatalogsSent,
        Statistic::CatalogsReceived,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Statistic::TotalFiles => "TotalFiles",
            Statistic::TotalFolders => "TotalFolders",
            Statistic::FilesSent => "FilesSent",
            Statistic::FilesReceived => "FilesReceived",
            Statistic::FilesDeleted => "FilesDeleted",
            Statistic::CatalogsSent => "CatalogsSent",
            Statistic::CatalogsReceived => "CatalogsReceived",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    counters: [AtomicI64; 7],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, stat: Statistic, delta: i64) {
        self.counters[stat.index()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Overwrite a counter, used when a rescan re-derives the totals.
    pub fn set(&self, stat: Statistic, value: i64) {
        self.counters[stat.index()].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Statistic) -> i64 {
        self.counters[stat.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, i64> {
        Statistic::ALL
            .iter()
            .map(|s| (s.name(), self.get(*s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_snapshot() {
        let stats = Statistics::new();
        stats.increment(Statistic::TotalFiles, 3);
        stats.increment(Statistic::TotalFiles, -1);
        stats.increment(Statistic::CatalogsSent, 1);

        assert_eq!(stats.get(Statistic::TotalFiles), 2);
        let snap = stats.snapshot();
        assert_eq!(snap["TotalFiles"], 2);
        assert_eq!(snap["CatalogsSent"], 1);
        assert_eq!(snap["FilesDeleted"], 0);
    }
}
