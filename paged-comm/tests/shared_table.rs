#![cfg(target_family = "unix")]
use memfile::CreateOptions;
use paged_comm::{CommSlot, CommTable, SlotStatus, WaitPolicy, MAX_COMM_SLOTS};

#[test]
fn two_mappings_share_slots() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len((16 * CommSlot::SIZE) as u64).unwrap();

    let engine = CommTable::new(&file).unwrap();
    let client = CommTable::new(&file).unwrap();
    assert_eq!(engine.len(), 16);

    let idx = engine.occupy(42).unwrap();
    let slot = client.slot(idx).unwrap();
    assert_eq!(slot.status(), SlotStatus::Occupied);
    assert_eq!(slot.owner(), 42);

    slot.bind("/data/logs", "trades", true).unwrap();
    slot.post_request(42, 7).unwrap();

    let seen = engine.slot(idx).unwrap();
    assert_eq!(seen.status(), SlotStatus::Requesting);
    assert_eq!(seen.folder(), "/data/logs");
    assert_eq!(seen.name(), "trades");
    assert_eq!(seen.page_number(), 7);
    assert!(seen.resolve(SlotStatus::Allocated));

    assert_eq!(
        slot.wait_resolved(&WaitPolicy::default()),
        Ok(SlotStatus::Allocated)
    );
}

#[test]
fn occupied_indices_are_unique() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comm");
    let table = CommTable::create(&path).unwrap();
    assert_eq!(table.len(), MAX_COMM_SLOTS);
    assert_eq!(table.file_size(), CommTable::FILE_SIZE);

    let mut seen = std::collections::HashSet::new();
    for owner in 0..MAX_COMM_SLOTS as u32 {
        let idx = table.occupy(owner).expect("a free slot");
        assert!(idx < table.len());
        assert!(seen.insert(idx), "slot {idx} handed out twice");
    }

    assert_eq!(table.occupy(0), None);

    table.slot(17).unwrap().reclaim();
    assert_eq!(table.occupy(99), Some(17));
}

#[test]
fn open_checks_announced_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comm");
    let _engine = CommTable::create(&path).unwrap();

    let client = CommTable::open(&path, CommTable::FILE_SIZE).unwrap();
    assert_eq!(client.len(), MAX_COMM_SLOTS);

    let err = CommTable::open(&path, CommTable::FILE_SIZE + 1).err().unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn out_of_bounds_slot() {
    let dir = tempfile::tempdir().unwrap();
    let table = CommTable::create(&dir.path().join("comm")).unwrap();
    assert!(table.slot(MAX_COMM_SLOTS).is_err());
}
