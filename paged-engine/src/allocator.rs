use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use paged_comm::{CommSlot, CommTable, SlotStatus};
use paged_provider::page_path;
use parking_lot::Mutex;

use crate::EngineRegistry;

/// Resolves outstanding page requests.
///
/// Writers are allocated any page of a journal as long as no other slot writes it. Readers are
/// allocated pages that exist.
#[derive(Debug, Default)]
pub struct Allocator {
    /// The slot currently writing each `(folder, name)` journal.
    writers: HashMap<(String, String), usize>,
    resolved: u64,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests resolved so far.
    pub fn resolved(&self) -> u64 {
        self.resolved
    }

    /// Number of journals with a known writer.
    pub fn journals(&self) -> usize {
        self.writers.len()
    }

    /// Resolve every request outstanding in `table`, returns how many there were.
    pub fn scan(&mut self, table: &CommTable) -> usize {
        // Forget writers whose slot was reclaimed or rebound since the last scan.
        self.writers
            .retain(|journal, &mut holder| writes(table, holder, journal));

        let mut resolved = 0;

        for (index, slot) in table.slots().iter().enumerate() {
            if slot.status() != SlotStatus::Requesting {
                continue;
            }

            let resolution = self.decide(table, index, slot);
            if slot.resolve(resolution) {
                resolved += 1;
            }
        }

        self.resolved += resolved as u64;
        resolved
    }

    /// Scan under the registry lock until `running` is cleared.
    ///
    /// Pauses for `idle` after every scan that found nothing to do.
    pub fn run(&mut self, registry: &Mutex<EngineRegistry>, running: &AtomicBool, idle: Duration) {
        while running.load(Ordering::Acquire) {
            let resolved = {
                let registry = registry.lock();
                self.scan(registry.table())
            };

            if resolved == 0 {
                std::thread::sleep(idle);
            }
        }

        tracing::info!(resolved = self.resolved, "allocator stopped");
    }

    fn decide(&mut self, table: &CommTable, index: usize, slot: &CommSlot) -> SlotStatus {
        let folder = slot.folder();
        let name = slot.name();
        let page_number = slot.page_number();

        if page_number < 0 {
            tracing::warn!(index, %folder, %name, page_number, "invalid page number");
            return SlotStatus::Denied;
        }

        if !slot.is_writer() {
            if page_path(Path::new(&folder), &name, page_number).exists() {
                return SlotStatus::Allocated;
            }

            tracing::debug!(index, %folder, %name, page_number, "page does not exist");
            return SlotStatus::Denied;
        }

        let key = (folder, name);
        if let Some(&holder) = self.writers.get(&key) {
            if holder != index && writes(table, holder, &key) {
                tracing::error!(index, holder, folder = %key.0, name = %key.1, "more than one writer");
                return SlotStatus::Conflict;
            }
        }

        self.writers.insert(key, index);
        SlotStatus::Allocated
    }
}

/// Whether slot `index` is still bound as the writer of `journal`.
///
/// A writer with a request of its own outstanding still holds the journal.
fn writes(table: &CommTable, index: usize, (folder, name): &(String, String)) -> bool {
    let Ok(slot) = table.slot(index) else {
        return false;
    };

    let status = slot.status();
    let bound = status.is_bound() || status == SlotStatus::Requesting;
    bound && slot.is_writer() && slot.folder() == *folder && slot.name() == *name
}

#[test]
fn one_writer_per_journal() {
    let dir = tempfile::tempdir().unwrap();
    let table = CommTable::create(&dir.path().join("comm")).unwrap();
    let mut allocator = Allocator::new();

    for owner in [1, 2] {
        let index = table.occupy(owner).unwrap();
        let slot = table.slot(index).unwrap();
        slot.bind("/journal", "md", true).unwrap();
    }

    let (first, second) = (table.slot(0).unwrap(), table.slot(1).unwrap());
    first.post_request(1, 1).unwrap();
    assert_eq!(allocator.scan(&table), 1);
    assert_eq!(first.status(), SlotStatus::Allocated);

    // Later pages keep the same writer.
    first.post_request(1, 2).unwrap();
    second.post_request(2, 2).unwrap();
    assert_eq!(allocator.scan(&table), 2);
    assert_eq!(first.status(), SlotStatus::Allocated);
    assert_eq!(second.status(), SlotStatus::Conflict);

    // Once the writer is gone the journal is free again.
    first.reclaim();
    second.post_request(2, 2).unwrap();
    allocator.scan(&table);
    assert_eq!(second.status(), SlotStatus::Allocated);
    assert_eq!(allocator.resolved(), 4);
    assert_eq!(allocator.journals(), 1);

    // Nothing left writing: the entry is dropped on the next scan.
    second.reclaim();
    assert_eq!(allocator.scan(&table), 0);
    assert_eq!(allocator.journals(), 0);
}

#[test]
fn requesting_writer_keeps_its_journal() {
    let dir = tempfile::tempdir().unwrap();
    let table = CommTable::create(&dir.path().join("comm")).unwrap();
    let mut allocator = Allocator::new();

    for owner in [1, 2] {
        let index = table.occupy(owner).unwrap();
        table.slot(index).unwrap().bind("/journal", "md", true).unwrap();
    }

    // The writer sits at the higher index, so its competitor is scanned first.
    let (other, holder) = (table.slot(0).unwrap(), table.slot(1).unwrap());
    holder.post_request(2, 1).unwrap();
    assert_eq!(allocator.scan(&table), 1);
    assert_eq!(holder.status(), SlotStatus::Allocated);

    holder.post_request(2, 2).unwrap();
    other.post_request(1, 2).unwrap();
    assert_eq!(allocator.scan(&table), 2);
    assert_eq!(other.status(), SlotStatus::Conflict);
    assert_eq!(holder.status(), SlotStatus::Allocated);

    // And stays the writer afterwards.
    other.post_request(1, 3).unwrap();
    allocator.scan(&table);
    assert_eq!(other.status(), SlotStatus::Conflict);
}

#[test]
fn rebound_writer_is_forgotten() {
    let dir = tempfile::tempdir().unwrap();
    let table = CommTable::create(&dir.path().join("comm")).unwrap();
    let mut allocator = Allocator::new();

    let index = table.occupy(1).unwrap();
    let slot = table.slot(index).unwrap();
    for name in ["md", "trades", "quotes"] {
        slot.bind("/journal", name, true).unwrap();
        slot.post_request(1, 1).unwrap();
        allocator.scan(&table);
        assert_eq!(slot.status(), SlotStatus::Allocated);
        assert_eq!(allocator.journals(), 1);

        slot.reclaim();
        assert!(slot.occupy(1));
    }
}

#[test]
fn readers_need_existing_pages() {
    let dir = tempfile::tempdir().unwrap();
    let table = CommTable::create(&dir.path().join("comm")).unwrap();
    let folder = dir.path().to_str().unwrap();
    let mut allocator = Allocator::new();

    let index = table.occupy(1).unwrap();
    let reader = table.slot(index).unwrap();
    reader.bind(folder, "md", false).unwrap();

    reader.post_request(1, 1).unwrap();
    allocator.scan(&table);
    assert_eq!(reader.status(), SlotStatus::Denied);

    std::fs::write(page_path(dir.path(), "md", 1), b"").unwrap();
    reader.post_request(1, 1).unwrap();
    allocator.scan(&table);
    assert_eq!(reader.status(), SlotStatus::Allocated);

    reader.post_request(1, -1).unwrap();
    allocator.scan(&table);
    assert_eq!(reader.status(), SlotStatus::Denied);
}
