use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::MmapRaw;

use crate::{CommError, CommSlot};

/// Number of slots in a table created by the engine.
pub const MAX_COMM_SLOTS: usize = 1000;

/// A mapped communication table.
pub struct CommTable {
    /// Resolved slice _into_ the memory map.
    ///
    /// The lifetime is a lie, the true one is that of `file`. Never return it unchanged; every
    /// accessor reborrows it for the lifetime of `self`.
    slots: &'static [CommSlot],
    /// Keeps the mapping alive.
    file: MmapRaw,
}

impl CommTable {
    /// The size of the file backing a table of `MAX_COMM_SLOTS`.
    pub const FILE_SIZE: usize = MAX_COMM_SLOTS * CommSlot::SIZE;

    /// Engine side: create the comm file at `path` and map it.
    ///
    /// An existing file is truncated, all slots start out as `Raw`.
    pub fn create(path: &Path) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(Self::FILE_SIZE as u64)?;

        tracing::debug!(path = %path.display(), size = Self::FILE_SIZE, "created comm file");
        Self::new(&file)
    }

    /// Client side: map the comm file announced by the engine.
    pub fn open(path: &Path, size: usize) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let table = Self::new(&file)?;

        if table.file.len() != size {
            let err = CommError::UnfittingLayout {
                expected: size,
                actual: table.file.len(),
            };

            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err));
        }

        Ok(table)
    }

    /// Map any file descriptor, the table covers as many whole slots as the file holds.
    pub fn new<T: AsRawFd>(fd: &T) -> Result<Self, std::io::Error> {
        let file = MmapRaw::map_raw(fd)?;
        Ok(Self::from_map(file))
    }

    pub(crate) fn from_map(file: MmapRaw) -> Self {
        let ptr = file.as_mut_ptr() as *const CommSlot;
        let len = file.len() / CommSlot::SIZE;

        // Safety: the pointer is page aligned and `len` whole slots are in-bounds of the mapping,
        // which we keep for as long as the slice is reachable. The slots consist of atomics only,
        // hence shared access from other processes is fine. Mapped file pages are initialized,
        // zero on first access, and every bit pattern is a valid `CommSlot`.
        let slots = unsafe { &*core::ptr::slice_from_raw_parts(ptr, len) };

        CommTable { slots, file }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The size in bytes of the mapping, as announced to clients.
    pub fn file_size(&self) -> usize {
        self.file.len()
    }

    pub fn slot(&self, index: usize) -> Result<&CommSlot, CommError> {
        self.slots.get(index).ok_or(CommError::OutOfBounds {
            index,
            len: self.slots.len(),
        })
    }

    pub fn slots(&self) -> &[CommSlot] {
        self.slots
    }

    /// Engine side: occupy the first free slot for the session `owner`.
    pub fn occupy(&self, owner: u32) -> Option<usize> {
        self.slots.iter().position(|slot| slot.occupy(owner))
    }
}
