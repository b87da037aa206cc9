use paged_comm::{CommTable, SlotStatus};
use paged_socket::{Registry, RegistryError};

use crate::{EngineRegistry, COMM_FILE_NAME};

fn registry() -> (tempfile::TempDir, EngineRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = EngineRegistry::create(&dir.path().join("engine")).unwrap();
    (dir, registry)
}

#[test]
fn grant_points_at_comm_file() {
    let (dir, mut registry) = registry();

    let grant = registry.register_client("W1", 42, true).unwrap();
    assert_eq!(grant.comm_file, dir.path().join("engine").join(COMM_FILE_NAME));
    assert_eq!(grant.file_size as usize, CommTable::FILE_SIZE);
    assert_ne!(grant.hash_code, 0);

    let mapped = CommTable::open(&grant.comm_file, grant.file_size as usize).unwrap();
    assert_eq!(mapped.len(), paged_comm::MAX_COMM_SLOTS);

    let session = registry.session("W1").unwrap();
    assert_eq!((session.pid, session.is_writer), (42, true));
}

#[test]
fn empty_names_are_refused() {
    let (_dir, mut registry) = registry();
    assert!(matches!(
        registry.register_client("", 1, false),
        Err(RegistryError::Refused(_))
    ));
    assert_eq!(registry.sessions(), 0);
}

#[test]
fn journals_need_the_live_session() {
    let (_dir, mut registry) = registry();

    assert!(matches!(
        registry.register_journal("W1", 7),
        Err(RegistryError::UnknownClient(_))
    ));

    let grant = registry.register_client("W1", 1, true).unwrap();
    assert!(matches!(
        registry.register_journal("W1", grant.hash_code.wrapping_add(1)),
        Err(RegistryError::StaleSession { .. })
    ));

    assert_eq!(registry.register_journal("W1", grant.hash_code).unwrap(), 0);
    assert_eq!(registry.register_journal("W1", grant.hash_code).unwrap(), 1);

    let slot = registry.table().slot(1).unwrap();
    assert_eq!(slot.status(), SlotStatus::Occupied);
    assert_eq!(slot.owner(), grant.hash_code);
}

#[test]
fn exit_reclaims_and_is_idempotent() {
    let (_dir, mut registry) = registry();
    let writer = registry.register_client("W1", 1, true).unwrap();
    let reader = registry.register_client("R1", 2, false).unwrap();

    registry.register_journal("W1", writer.hash_code).unwrap();
    registry.register_journal("R1", reader.hash_code).unwrap();
    registry.register_journal("W1", writer.hash_code).unwrap();

    registry.exit_client("W1", writer.hash_code);
    registry.exit_client("W1", writer.hash_code);
    registry.exit_client("nobody", 3);

    let statuses: Vec<_> = registry.table().slots()[..3]
        .iter()
        .map(|slot| slot.status())
        .collect();
    assert_eq!(
        statuses,
        [SlotStatus::Raw, SlotStatus::Occupied, SlotStatus::Raw]
    );
    assert_eq!(registry.sessions(), 1);

    // Freed slots are handed out again.
    assert_eq!(registry.register_journal("R1", reader.hash_code).unwrap(), 0);
}

#[test]
fn reregistration_replaces_session() {
    let (_dir, mut registry) = registry();
    let old = registry.register_client("W1", 1, true).unwrap();
    registry.register_journal("W1", old.hash_code).unwrap();

    let new = registry.register_client("W1", 2, true).unwrap();
    assert_ne!(old.hash_code, new.hash_code);
    assert_eq!(registry.table().slot(0).unwrap().status(), SlotStatus::Raw);
    assert_eq!(registry.sessions(), 1);

    // Requests of the old session no longer count.
    registry.exit_client("W1", old.hash_code);
    assert_eq!(registry.session("W1").unwrap().hash_code, new.hash_code);
    assert!(registry.register_journal("W1", old.hash_code).is_err());
}

#[test]
fn comm_file_removed_on_drop() {
    let (_dir, registry) = registry();
    let path = registry.comm_file().to_owned();
    assert!(path.exists());

    drop(registry);
    assert!(!path.exists());
}
