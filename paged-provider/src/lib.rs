//! Page providers hand journal pages to readers and writers.
//!
//! A [`ClientPageProvider`] negotiates every page with a page engine: it registers over the control
//! plane once, binds a comm slot per journal and then asks for pages through shared memory only.
//! A [`LocalPageProvider`] maps pages directly and never talks to an engine. Which one a process
//! uses is decided by its [`ProviderConfig`].
use std::path::Path;

use paged_comm::CommError;
use paged_socket::TransportError;
use thiserror::Error;

mod client;
mod config;
mod local;
mod page;

pub use client::ClientPageProvider;
pub use config::{ProviderConfig, Topology};
pub use local::LocalPageProvider;
pub use page::{page_path, MmapPageLoader, Page, PageLoader, JOURNAL_PAGE_SIZE};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("cannot register client: {client}")]
    Registration { client: String },
    #[error("more than one writer is writing {folder} {name}")]
    WriterConflict { folder: String, name: String },
    #[error("journal {name} is not bound to a comm slot")]
    Unbound { name: String },
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A journal a provider serves pages for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalHandle {
    folder: String,
    name: String,
    slot: Option<usize>,
}

impl JournalHandle {
    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The comm slot negotiating this journal's pages, if any.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    fn folder_path(&self) -> &Path {
        Path::new(&self.folder)
    }
}

pub trait PageProvider {
    fn register_journal(&mut self, folder: &str, name: &str)
        -> Result<JournalHandle, ProviderError>;

    /// `Ok(None)` when no page is available.
    fn acquire_page(
        &mut self,
        journal: &JournalHandle,
        page_number: i32,
    ) -> Result<Option<Page>, ProviderError>;

    fn release_page(&mut self, page: Page) -> Result<(), ProviderError>;

    fn is_writer(&self) -> bool;

    /// Writers may always revise pages, readers only when they asked to.
    fn revise_allowed(&self) -> bool;
}
