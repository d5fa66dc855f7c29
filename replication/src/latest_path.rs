//! Latest-Path Table (§3, §4.3): per log-group, the newest WAL path known
//! on this node, used to seed a source created after the most recent
//! roll. Single mutation point is `preLogRoll`; guarded by its own lock
//! in the manager (§5), so this type is a plain, unlocked map.

use std::collections::BTreeMap;

use crate::wal::{Prefix, WalLog};

#[derive(Default, Debug)]
pub struct LatestPathTable {
    paths: BTreeMap<Prefix, WalLog>,
}

impl LatestPathTable {
    pub fn new() -> Self {
        LatestPathTable::default()
    }

    pub fn record(&mut self, log: WalLog) {
        self.paths.insert(log.name().prefix(), log);
    }

    pub fn snapshot(&self) -> BTreeMap<Prefix, WalLog> {
        self.paths.clone()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_only_newest_per_prefix() {
        let mut t = LatestPathTable::new();
        t.record(WalLog::new("/wal/w.100"));
        t.record(WalLog::new("/wal/w.101"));
        t.record(WalLog::new("/wal/v.1"));

        let snap = t.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&WalLog::new("/wal/w.101").name().prefix()].name().as_str(), "w.101");
    }
}
