//! The allocation ledger: an independent record of every allocation the
//! tracer has observed, live or released.
//!
//! Records are kept in insertion order (the shutdown report walks them in
//! that order) and are never removed before [`Ledger::teardown()`], so that a
//! second `free()` of the same address can still be told apart from a `free()`
//! of an address we have never seen.
//!
//! The real allocator is free to hand out an address again once it has been
//! released. That produces a *new* record. Lookups always resolve to the most
//! recently inserted record for an address:
//!
//! ```plaintext
//! insert(0x10, 8)   [#0 0x10 live]
//! release(0x10)     [#0 0x10 released]
//! insert(0x10, 32)  [#0 0x10 released, #1 0x10 live]  find(0x10) -> #1
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::serialize::serde_addr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocRecord {
    /// Where is this allocation?
    #[serde(with = "serde_addr")]
    pub address: usize,
    /// How many bytes were requested for it?
    pub size: usize,
    /// `1` on insertion, decremented by every release. Anything `<= 0` means
    /// released, anything `< 0` means released more than once.
    pub live_count: isize,
}

impl AllocRecord {
    pub const fn new(address: usize, size: usize) -> Self {
        Self {
            address,
            size,
            live_count: 1,
        }
    }

    pub const fn is_live(&self) -> bool {
        self.live_count > 0
    }

    /// Did the release that produced this record hit an already released
    /// allocation?
    pub const fn is_double_released(&self) -> bool {
        self.live_count < 0
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    /// Every record ever inserted, oldest first
    records: Vec<AllocRecord>,
    /// address -> index into `records` of the newest record for that address
    latest: HashMap<usize, usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new allocation. The null address is never tracked, so
    /// this returns `None` for it.
    pub fn insert(&mut self, address: usize, size: usize) -> Option<AllocRecord> {
        if address == 0 {
            return None;
        }
        let record = AllocRecord::new(address, size);
        self.latest.insert(address, self.records.len());
        self.records.push(record);
        Some(record)
    }

    /// The most recently inserted record for `address`, live or not
    pub fn find(&self, address: usize) -> Option<&AllocRecord> {
        self.latest.get(&address).map(|&i| &self.records[i])
    }

    /// Mark the newest record for `address` as released and return a copy of
    /// the updated record.
    ///
    /// # Returns
    ///
    /// - `None` if `address` was never inserted
    /// - `Some(record)` otherwise; check [`AllocRecord::is_double_released()`]
    ///   to find out if it had already been released before this call
    pub fn release(&mut self, address: usize) -> Option<AllocRecord> {
        let &i = self.latest.get(&address)?;
        let record = &mut self.records[i];
        record.live_count -= 1;
        Some(*record)
    }

    /// All live records, oldest first
    pub fn live(&self) -> impl Iterator<Item = &AllocRecord> + '_ {
        self.records.iter().filter(|r| r.is_live())
    }

    /// All records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &AllocRecord> + '_ {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.live().count()
    }

    /// Drop every record and give the storage back
    pub fn teardown(&mut self) {
        self.records = Vec::new();
        self.latest = HashMap::new();
    }
}
