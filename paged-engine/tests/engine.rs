#![cfg(target_family = "unix")]
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use paged_comm::{CommError, SlotStatus, WaitPolicy};
use paged_engine::{Allocator, EngineRegistry};
use paged_provider::{JournalHandle, PageProvider, ProviderConfig, ProviderError};
use paged_socket::{Dispatcher, StopHandle};
use parking_lot::Mutex;

struct Running {
    dir: tempfile::TempDir,
    registry: Arc<Mutex<EngineRegistry>>,
    stop: StopHandle,
    allocating: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

type Provider = Box<dyn PageProvider + Send>;

impl Running {
    fn start() -> Self {
        Self::launch(true)
    }

    /// No allocator thread, requests stay outstanding until the test scans.
    fn paused() -> Self {
        Self::launch(false)
    }

    fn launch(allocate: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Mutex::new(
            EngineRegistry::create(&dir.path().join("engine")).unwrap(),
        ));

        let dispatcher = Dispatcher::bind(dir.path().join("paged.sock"), registry.clone()).unwrap();
        let stop = dispatcher.stop_handle();
        let allocating = Arc::new(AtomicBool::new(true));

        let mut threads = vec![std::thread::spawn(move || dispatcher.run())];
        if allocate {
            let registry = registry.clone();
            let allocating = allocating.clone();
            threads.push(std::thread::spawn(move || {
                Allocator::new().run(&registry, &allocating, Duration::from_micros(50))
            }));
        }

        Running {
            dir,
            registry,
            stop,
            allocating,
            threads,
        }
    }

    /// Run one scan as soon as every slot in `slots` has a request outstanding.
    fn scan_requests(&self, allocator: &mut Allocator, slots: &[usize]) -> usize {
        WaitPolicy::default()
            .wait_for(|| {
                let registry = self.registry.lock();
                let table = registry.table();
                slots
                    .iter()
                    .all(|&index| table.slot(index).unwrap().status() == SlotStatus::Requesting)
                    .then_some(())
            })
            .expect("requests did not arrive");

        allocator.scan(self.registry.lock().table())
    }

    fn config(&self, client: &str, is_writer: bool) -> ProviderConfig {
        let mut config = ProviderConfig::new(client, is_writer);
        config.socket = self.dir.path().join("paged.sock");
        config.page_size = 4096;
        config
    }

    fn journals(&self) -> String {
        self.dir.path().join("journal").to_str().unwrap().to_owned()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.allocating
            .store(false, std::sync::atomic::Ordering::Release);
        self.stop.stop();

        for thread in self.threads.drain(..) {
            thread.join().unwrap();
        }
    }
}

#[test]
fn writer_and_reader_share_pages() {
    let engine = Running::start();
    let folder = engine.journals();

    let mut writer = engine.config("W1", true).build().unwrap();
    let journal = writer.register_journal(&folder, "md").unwrap();
    assert_eq!(journal.slot(), Some(0));

    let page = writer.acquire_page(&journal, 1).unwrap().expect("writer page");
    page.write_at(0, b"tick").unwrap();
    writer.release_page(page).unwrap();

    let mut reader = engine.config("R1", false).build().unwrap();
    let journal = reader.register_journal(&folder, "md").unwrap();

    let page = reader.acquire_page(&journal, 1).unwrap().expect("existing page");
    let mut buf = [0; 4];
    page.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"tick");
    reader.release_page(page).unwrap();

    assert!(reader.acquire_page(&journal, 2).unwrap().is_none());
}

#[test]
fn second_writer_is_rejected() {
    let engine = Running::start();
    let folder = engine.journals();

    let mut first = engine.config("W1", true).build().unwrap();
    let journal = first.register_journal(&folder, "md").unwrap();
    assert!(first.acquire_page(&journal, 1).unwrap().is_some());

    let mut second = engine.config("W2", true).build().unwrap();
    let other = second.register_journal(&folder, "md").unwrap();
    assert!(matches!(
        second.acquire_page(&other, 1),
        Err(ProviderError::WriterConflict { .. })
    ));

    // Other journals are unaffected.
    let trades = second.register_journal(&folder, "trades").unwrap();
    assert!(second.acquire_page(&trades, 1).unwrap().is_some());

    // Once the first writer leaves, the journal is free.
    drop(first);
    assert!(second.acquire_page(&other, 1).unwrap().is_some());
}

/// Acquire and release `page` on another thread. `Ok(true)` if the page was allocated.
fn acquire(
    mut provider: Provider,
    journal: &JournalHandle,
    page: i32,
) -> JoinHandle<(Provider, Result<bool, ProviderError>)> {
    let journal = journal.clone();
    std::thread::spawn(move || {
        let outcome = match provider.acquire_page(&journal, page) {
            Ok(Some(page)) => provider.release_page(page).map(|()| true),
            Ok(None) => Ok(false),
            Err(err) => Err(err),
        };

        (provider, outcome)
    })
}

/// Two writers of one journal with requests outstanding in the same scan. The established
/// writer keeps the journal no matter which of them sits at the lower slot index.
fn contended_scan(interloper_first: bool) {
    let engine = Running::paused();
    let folder = engine.journals();
    let mut allocator = Allocator::new();

    // Park a placeholder on slot 0 so the established writer lands behind it.
    let mut placeholder = engine.config("X", true).build().unwrap();
    if interloper_first {
        placeholder.register_journal(&folder, "scratch").unwrap();
    }

    let mut writer = engine.config("W1", true).build().unwrap();
    let md = writer.register_journal(&folder, "md").unwrap();
    let writer_slot = md.slot().unwrap();
    assert_eq!(writer_slot, usize::from(interloper_first));
    drop(placeholder);

    let pending = acquire(writer, &md, 1);
    assert_eq!(engine.scan_requests(&mut allocator, &[writer_slot]), 1);
    let (writer, outcome) = pending.join().unwrap();
    assert!(outcome.unwrap());

    let mut interloper = engine.config("W2", true).build().unwrap();
    let other = interloper.register_journal(&folder, "md").unwrap();
    let interloper_slot = other.slot().unwrap();
    assert_eq!(interloper_slot < writer_slot, interloper_first);

    let pending_writer = acquire(writer, &md, 2);
    let pending_interloper = acquire(interloper, &other, 2);
    assert_eq!(
        engine.scan_requests(&mut allocator, &[writer_slot, interloper_slot]),
        2
    );

    let (writer, outcome) = pending_writer.join().unwrap();
    assert!(outcome.unwrap());
    let (interloper, outcome) = pending_interloper.join().unwrap();
    assert!(matches!(outcome, Err(ProviderError::WriterConflict { .. })));

    // Still the same writer on the next round.
    let pending = acquire(interloper, &other, 3);
    assert_eq!(engine.scan_requests(&mut allocator, &[interloper_slot]), 1);
    let (_, outcome) = pending.join().unwrap();
    assert!(matches!(outcome, Err(ProviderError::WriterConflict { .. })));

    let pending = acquire(writer, &md, 3);
    assert_eq!(engine.scan_requests(&mut allocator, &[writer_slot]), 1);
    assert!(pending.join().unwrap().1.unwrap());
}

#[test]
fn contended_writer_at_higher_slot_keeps_journal() {
    contended_scan(true);
}

#[test]
fn contended_writer_at_lower_slot_keeps_journal() {
    contended_scan(false);
}

#[test]
fn replaced_session_loses_its_slots() {
    let engine = Running::start();
    let folder = engine.journals();

    let mut stale = engine.config("W1", true).build().unwrap();
    let md = stale.register_journal(&folder, "md").unwrap();
    assert_eq!(md.slot(), Some(0));

    // Same name again: the engine reclaims the first session's slots and reuses slot 0.
    let mut current = engine.config("W1", true).build().unwrap();
    let trades = current.register_journal(&folder, "trades").unwrap();
    assert_eq!(trades.slot(), Some(0));

    assert!(matches!(
        stale.acquire_page(&md, 1),
        Err(ProviderError::Comm(CommError::NotOwner { .. }))
    ));
    {
        let registry = engine.registry.lock();
        let slot = registry.table().slot(0).unwrap();
        assert_eq!(slot.name(), "trades");
        assert_eq!(slot.status(), SlotStatus::Holding);
    }

    assert!(current.acquire_page(&trades, 1).unwrap().is_some());

    // The stale exit is ignored, the current session keeps its slot.
    drop(stale);
    assert_eq!(engine.registry.lock().sessions(), 1);
    assert!(current.acquire_page(&trades, 2).unwrap().is_some());
}

#[test]
fn exit_frees_slots() {
    let engine = Running::start();
    let folder = engine.journals();

    let mut writer = engine.config("W1", true).build().unwrap();
    writer.register_journal(&folder, "md").unwrap();
    writer.register_journal(&folder, "trades").unwrap();
    assert_eq!(engine.registry.lock().sessions(), 1);

    drop(writer);

    let registry = engine.registry.lock();
    assert_eq!(registry.sessions(), 0);
    assert!(registry
        .table()
        .slots()
        .iter()
        .all(|slot| slot.status() == SlotStatus::Raw));
}

#[test]
fn missing_engine_fails_registration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ProviderConfig::new("W1", true);
    config.socket = dir.path().join("nobody.sock");

    assert!(matches!(config.build(), Err(ProviderError::Transport(_))));
}
