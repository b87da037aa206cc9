use crate::{JournalHandle, MmapPageLoader, Page, PageLoader, PageProvider, ProviderError};

/// Maps pages in-process. There is no engine arbitrating writers.
pub struct LocalPageProvider<L = MmapPageLoader> {
    loader: L,
    is_writer: bool,
    revise_allowed: bool,
}

impl<L: PageLoader> LocalPageProvider<L> {
    pub fn new(loader: L, is_writer: bool, revise_requested: bool) -> Self {
        LocalPageProvider {
            loader,
            is_writer,
            revise_allowed: is_writer || revise_requested,
        }
    }
}

impl<L: PageLoader> PageProvider for LocalPageProvider<L> {
    fn register_journal(
        &mut self,
        folder: &str,
        name: &str,
    ) -> Result<JournalHandle, ProviderError> {
        Ok(JournalHandle {
            folder: folder.to_owned(),
            name: name.to_owned(),
            slot: None,
        })
    }

    fn acquire_page(
        &mut self,
        journal: &JournalHandle,
        page_number: i32,
    ) -> Result<Option<Page>, ProviderError> {
        let page = self.loader.load(
            journal.folder_path(),
            &journal.name,
            page_number,
            self.is_writer,
            false,
        )?;

        Ok(page)
    }

    fn release_page(&mut self, page: Page) -> Result<(), ProviderError> {
        Ok(self.loader.release(page, false)?)
    }

    fn is_writer(&self) -> bool {
        self.is_writer
    }

    fn revise_allowed(&self) -> bool {
        self.revise_allowed
    }
}
