use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::{CommError, WaitPolicy};

/// Bytes reserved for the journal folder, including the NUL terminator.
pub const FOLDER_MAX_LENGTH: usize = 128;
/// Bytes reserved for the journal name, including the NUL terminator.
pub const NAME_MAX_LENGTH: usize = 32;

/// The state of one slot. The discriminants are the values stored in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SlotStatus {
    /// Free, not handed to any client.
    Raw = 0,
    /// Reserved by the engine for a client, not yet bound to a journal.
    Occupied = 1,
    /// Bound to a journal, no request outstanding.
    Holding = 2,
    /// The client posted a page number and waits for the allocator.
    Requesting = 3,
    /// The requested page was granted.
    Allocated = 4,
    /// More than one writer asked for pages of the same journal.
    Conflict = 5,
    /// The allocator declined the request, e.g. a reader asked for a page that does not exist.
    Denied = 6,
}

impl SlotStatus {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => SlotStatus::Raw,
            1 => SlotStatus::Occupied,
            2 => SlotStatus::Holding,
            3 => SlotStatus::Requesting,
            4 => SlotStatus::Allocated,
            5 => SlotStatus::Conflict,
            6 => SlotStatus::Denied,
            _ => return None,
        })
    }

    /// A value only the allocator writes, ending one request cycle.
    pub const fn is_resolution(self) -> bool {
        matches!(
            self,
            SlotStatus::Allocated | SlotStatus::Conflict | SlotStatus::Denied
        )
    }

    /// Whether the owning client may post a new request from this state.
    ///
    /// A resolution counts as `Holding` once it has been observed.
    pub const fn is_bound(self) -> bool {
        matches!(self, SlotStatus::Holding) || self.is_resolution()
    }
}

/// One entry of the communication table.
///
/// Do not reorder, the layout is shared with every process mapping the table.
#[derive(Default)]
#[repr(C)]
pub struct CommSlot {
    status: AtomicU32,
    /// Hash code of the client session the engine occupied this slot for.
    owner: AtomicU32,
    is_writer: AtomicU32,
    page_number: AtomicI32,
    folder: [AtomicU32; FOLDER_MAX_LENGTH / 4],
    name: [AtomicU32; NAME_MAX_LENGTH / 4],
}

const _: () = assert!(core::mem::size_of::<CommSlot>() == CommSlot::SIZE);

impl CommSlot {
    pub const SIZE: usize = 16 + FOLDER_MAX_LENGTH + NAME_MAX_LENGTH;

    /// The current status.
    ///
    /// Values outside of [`SlotStatus`] read as `Denied`: the slot was resolved by someone, but
    /// it surely did not grant a page.
    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_raw(self.status.load(Ordering::Acquire)).unwrap_or(SlotStatus::Denied)
    }

    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn is_writer(&self) -> bool {
        self.is_writer.load(Ordering::Relaxed) != 0
    }

    /// The page number of the most recent request.
    pub fn page_number(&self) -> i32 {
        self.page_number.load(Ordering::Relaxed)
    }

    pub fn folder(&self) -> String {
        load_text(&self.folder)
    }

    pub fn name(&self) -> String {
        load_text(&self.name)
    }

    /// Engine side: claim a free slot for the session `owner`.
    ///
    /// Returns `false` if the slot was not free.
    pub fn occupy(&self, owner: u32) -> bool {
        let raw = SlotStatus::Raw as u32;
        let occupied = SlotStatus::Occupied as u32;

        if self
            .status
            .compare_exchange(raw, occupied, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        self.owner.store(owner, Ordering::Relaxed);
        self.is_writer.store(0, Ordering::Relaxed);
        self.page_number.store(0, Ordering::Relaxed);
        clear_text(&self.folder);
        clear_text(&self.name);
        // Publish the cleared fields.
        self.status.store(occupied, Ordering::Release);
        true
    }

    /// Client side: attach the occupied slot to a journal.
    pub fn bind(&self, folder: &str, name: &str, is_writer: bool) -> Result<(), CommError> {
        check_text(folder, FOLDER_MAX_LENGTH)?;
        check_text(name, NAME_MAX_LENGTH)?;

        let current = self.status();
        if current != SlotStatus::Occupied {
            return Err(CommError::NotOccupied(current));
        }

        store_text(&self.folder, folder);
        store_text(&self.name, name);
        self.is_writer.store(u32::from(is_writer), Ordering::Relaxed);
        self.status
            .store(SlotStatus::Holding as u32, Ordering::Release);

        Ok(())
    }

    /// Client side: ask for `page_number` on behalf of the session `owner`.
    ///
    /// The page number is sequenced before the status flip, the allocator reads it only after
    /// observing `Requesting`. A slot the engine reclaimed and handed to another session is
    /// refused.
    pub fn post_request(&self, owner: u32, page_number: i32) -> Result<(), CommError> {
        let current = self.status();
        if !current.is_bound() {
            return Err(CommError::NotBound(current));
        }

        let actual = self.owner();
        if actual != owner {
            return Err(CommError::NotOwner {
                expected: owner,
                actual,
            });
        }

        self.page_number.store(page_number, Ordering::Relaxed);
        self.status
            .compare_exchange(
                current as u32,
                SlotStatus::Requesting as u32,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map_err(|raw| {
                CommError::NotBound(SlotStatus::from_raw(raw).unwrap_or(SlotStatus::Denied))
            })?;

        Ok(())
    }

    /// Client side: wait until the request is no longer outstanding and return its resolution.
    pub fn wait_resolved(&self, policy: &WaitPolicy) -> Result<SlotStatus, CommError> {
        policy
            .wait_for(|| {
                let status = self.status();
                (status != SlotStatus::Requesting).then_some(status)
            })
            .ok_or(CommError::Timeout)
    }

    /// Allocator side: finish an outstanding request.
    ///
    /// Returns `false`, and changes nothing, if no request was outstanding.
    pub fn resolve(&self, resolution: SlotStatus) -> bool {
        debug_assert!(resolution.is_resolution(), "{resolution:?} does not end a request");

        self.status
            .compare_exchange(
                SlotStatus::Requesting as u32,
                resolution as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Engine side: return the slot to the free pool.
    pub fn reclaim(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.is_writer.store(0, Ordering::Relaxed);
        self.page_number.store(0, Ordering::Relaxed);
        clear_text(&self.folder);
        clear_text(&self.name);
        self.status.store(SlotStatus::Raw as u32, Ordering::Release);
    }
}

fn check_text(text: &str, max: usize) -> Result<(), CommError> {
    if text.len() >= max {
        return Err(CommError::TextTooLong {
            len: text.len(),
            max: max - 1,
        });
    }

    if text.as_bytes().contains(&0) {
        return Err(CommError::InvalidText);
    }

    Ok(())
}

/// Write NUL-padded text word by word. The caller checked the length.
fn store_text(words: &[AtomicU32], text: &str) {
    let mut chunks = text.as_bytes().chunks(4);

    for word in words {
        let mut bytes = [0; 4];
        if let Some(ch) = chunks.next() {
            bytes[..ch.len()].copy_from_slice(ch);
        }

        word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
    }
}

fn load_text(words: &[AtomicU32]) -> String {
    let mut text = Vec::with_capacity(words.len() * 4);

    for word in words {
        let bytes = word.load(Ordering::Relaxed).to_le_bytes();
        let end = bytes.iter().position(|&b| b == 0);
        text.extend_from_slice(&bytes[..end.unwrap_or(4)]);

        if end.is_some() {
            break;
        }
    }

    String::from_utf8_lossy(&text).into_owned()
}

fn clear_text(words: &[AtomicU32]) {
    for word in words {
        word.store(0, Ordering::Relaxed);
    }
}

#[test]
fn text_roundtrip_at_limits() {
    let slot = CommSlot::default();
    assert!(slot.occupy(7));

    let folder = "f".repeat(FOLDER_MAX_LENGTH - 1);
    let name = "n".repeat(NAME_MAX_LENGTH - 1);
    slot.bind(&folder, &name, true).unwrap();

    assert_eq!(slot.folder(), folder);
    assert_eq!(slot.name(), name);
    assert!(slot.is_writer());
}

#[test]
fn text_rejected_when_too_long() {
    let slot = CommSlot::default();
    assert!(slot.occupy(7));

    let name = "n".repeat(NAME_MAX_LENGTH);
    assert_eq!(
        slot.bind("/data", &name, false),
        Err(CommError::TextTooLong {
            len: NAME_MAX_LENGTH,
            max: NAME_MAX_LENGTH - 1
        }),
    );
    assert_eq!(slot.bind("/da\0ta", "x", false), Err(CommError::InvalidText));
    // Nothing was written, the slot is still waiting for a valid bind.
    assert_eq!(slot.status(), SlotStatus::Occupied);
}
