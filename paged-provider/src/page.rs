use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};

/// Size of a journal page file unless configured otherwise.
pub const JOURNAL_PAGE_SIZE: usize = 128 << 20;

/// The file backing page `page_number` of journal `name` in `folder`.
pub fn page_path(folder: &Path, name: &str, page_number: i32) -> PathBuf {
    folder.join(format!("yjj.{name}.{page_number}.journal"))
}

/// Maps and unmaps the storage of journal pages.
///
/// `quick` loads skip pinning the page into memory. Remote providers load quickly since the
/// engine keeps the pages resident, local providers pin pages themselves.
pub trait PageLoader {
    /// Returns `None` if a read-only page does not exist.
    fn load(
        &self,
        folder: &Path,
        name: &str,
        page_number: i32,
        writable: bool,
        quick: bool,
    ) -> Result<Option<Page>, io::Error>;

    fn release(&self, page: Page, quick: bool) -> Result<(), io::Error>;
}

/// A mapped journal page.
///
/// The mapping is shared with every other process that maps the same page, its contents may change
/// at any time. Access goes through copies, never through references into the map.
pub struct Page {
    number: i32,
    path: PathBuf,
    map: MmapRaw,
    writable: bool,
    locked: bool,
}

impl Page {
    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether the page is pinned in memory.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Start of the mapping, for record layers that manage the page contents themselves.
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), io::Error> {
        self.check_range(offset, buf.len())?;
        // Safety: the range is in-bounds of the mapping, `buf` is exclusive to us.
        unsafe {
            core::ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), io::Error> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("page {} is mapped read-only", self.number),
            ));
        }

        self.check_range(offset, data.len())?;
        // Safety: the range is in-bounds of a writable mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len())
        };
        Ok(())
    }

    pub fn flush(&self) -> Result<(), io::Error> {
        if self.writable {
            self.map.flush()?;
        }

        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), io::Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {offset}+{len} exceeds page of {} bytes", self.map.len()),
            )),
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("number", &self.number)
            .field("path", &self.path)
            .field("len", &self.map.len())
            .field("writable", &self.writable)
            .field("locked", &self.locked)
            .finish()
    }
}

/// Maps page files `yjj.<name>.<page>.journal` with `mmap`.
#[derive(Clone, Copy, Debug)]
pub struct MmapPageLoader {
    page_size: usize,
}

impl MmapPageLoader {
    pub fn new(page_size: usize) -> Self {
        MmapPageLoader { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Default for MmapPageLoader {
    fn default() -> Self {
        Self::new(JOURNAL_PAGE_SIZE)
    }
}

impl PageLoader for MmapPageLoader {
    fn load(
        &self,
        folder: &Path,
        name: &str,
        page_number: i32,
        writable: bool,
        quick: bool,
    ) -> Result<Option<Page>, io::Error> {
        let path = page_path(folder, name, page_number);

        let map = if writable {
            std::fs::create_dir_all(folder)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if file.metadata()?.len() < self.page_size as u64 {
                file.set_len(self.page_size as u64)?;
            }

            MmapOptions::new().len(self.page_size).map_raw(&file)?
        } else {
            let file = match OpenOptions::new().read(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "page does not exist");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };

            MmapOptions::new().map_raw_read_only(&file)?
        };

        let locked = !quick && lock(&map, &path);
        tracing::trace!(path = %path.display(), writable, locked, "loaded page");

        Ok(Some(Page {
            number: page_number,
            path,
            map,
            writable,
            locked,
        }))
    }

    fn release(&self, page: Page, quick: bool) -> Result<(), io::Error> {
        if !quick && page.locked {
            // Safety: the range is exactly the mapping we locked.
            let ret = unsafe { libc::munlock(page.map.as_ptr() as *const libc::c_void, page.map.len()) };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        page.flush()?;
        tracing::trace!(path = %page.path.display(), "released page");
        Ok(())
    }
}

/// Pin the mapping into memory. Failing to do so only costs latency.
fn lock(map: &MmapRaw, path: &Path) -> bool {
    // Safety: the range is exactly the mapping.
    if unsafe { libc::mlock(map.as_ptr() as *const libc::c_void, map.len()) } == -1 {
        let err = io::Error::last_os_error();
        tracing::warn!(path = %path.display(), %err, "failed to lock page in memory");
        return false;
    }

    true
}

#[test]
fn writer_creates_sized_page() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("journal");
    let loader = MmapPageLoader::new(4096);

    let page = loader.load(&folder, "md", 3, true, true).unwrap().unwrap();
    assert_eq!(page.number(), 3);
    assert_eq!(page.len(), 4096);
    assert_eq!(page.path(), folder.join("yjj.md.3.journal"));
    assert!(!page.is_locked());

    page.write_at(4090, b"tail!!").unwrap();
    assert!(page.write_at(4091, b"tail!!").is_err());
    loader.release(page, true).unwrap();

    let page = loader.load(&folder, "md", 3, false, true).unwrap().unwrap();
    let mut buf = [0; 6];
    page.read_at(4090, &mut buf).unwrap();
    assert_eq!(&buf, b"tail!!");
}

#[test]
fn readers_do_not_create_pages() {
    let dir = tempfile::tempdir().unwrap();
    let loader = MmapPageLoader::new(4096);

    assert!(loader.load(dir.path(), "md", 1, false, false).unwrap().is_none());
    assert!(!page_path(dir.path(), "md", 1).exists());
}

#[test]
fn read_only_pages_reject_writes() {
    let dir = tempfile::tempdir().unwrap();
    let loader = MmapPageLoader::new(4096);
    drop(loader.load(dir.path(), "md", 1, true, true).unwrap());

    let page = loader.load(dir.path(), "md", 1, false, false).unwrap().unwrap();
    let err = page.write_at(0, b"x").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    loader.release(page, false).unwrap();
}
