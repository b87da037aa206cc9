use std::collections::HashMap;
use std::path::Path;

use paged_comm::{CommError, CommTable, SlotStatus, WaitPolicy};
use paged_socket::protocol::ClockReply;
use paged_socket::{
    ProtocolError, Reply, Request, RequestType, Transport, TransportError, UnixTransport,
};

use crate::{JournalHandle, MmapPageLoader, Page, PageLoader, PageProvider, ProviderError};

/// Negotiates pages with a page engine.
///
/// Registration happens on construction. Once a journal is bound to its comm slot, acquiring a
/// page costs two stores and a wait on shared memory.
pub struct ClientPageProvider<T: Transport = UnixTransport, L: PageLoader = MmapPageLoader> {
    client: String,
    transport: T,
    loader: L,
    comm: CommTable,
    hash_code: u32,
    is_writer: bool,
    revise_allowed: bool,
    wait: WaitPolicy,
    /// Comm slot of every journal bound in this session, by `(folder, name)`.
    journals: HashMap<(String, String), usize>,
    exited: bool,
}

impl<T: Transport, L: PageLoader> ClientPageProvider<T, L> {
    /// Register `client` with the engine behind `transport` and map its comm table.
    pub fn register(
        client: &str,
        is_writer: bool,
        revise_requested: bool,
        transport: T,
        loader: L,
    ) -> Result<Self, ProviderError> {
        let kind = if is_writer {
            RequestType::WriterRegister
        } else {
            RequestType::ReaderRegister
        };

        let mut request = Request::new(kind, client);
        request.pid = std::process::id();

        let grant = match transport.call(&request)? {
            Reply::Client(reply) if reply.success && reply.kind == kind => reply,
            _ => {
                tracing::error!(client, "failed to register client");
                return Err(ProviderError::Registration {
                    client: client.to_owned(),
                });
            }
        };

        let comm = CommTable::open(Path::new(&grant.comm_file), grant.file_size as usize)?;
        tracing::debug!(client, comm_file = %grant.comm_file, slots = comm.len(), "registered client");

        Ok(ClientPageProvider {
            client: client.to_owned(),
            transport,
            loader,
            comm,
            hash_code: grant.hash_code,
            is_writer,
            revise_allowed: is_writer || revise_requested,
            wait: WaitPolicy::default(),
            journals: HashMap::new(),
            exited: false,
        })
    }

    /// Configure how long page requests wait for the allocator.
    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// The token the engine issued for this session.
    pub fn hash_code(&self) -> u32 {
        self.hash_code
    }

    /// Query the engine's clock.
    pub fn clock(&self) -> Result<ClockReply, ProviderError> {
        match self.transport.call(&Request::new(RequestType::ClockQuery, &self.client))? {
            Reply::Clock(clock) => Ok(clock),
            other => Err(TransportError::from(ProtocolError::Mismatch {
                expected: RequestType::ClockQuery,
                actual: other.kind(),
            })
            .into()),
        }
    }

    /// Say good bye. The engine reclaims all slots of this session.
    ///
    /// Called on drop unless done before.
    pub fn exit(&mut self) -> Result<(), ProviderError> {
        if self.exited {
            return Ok(());
        }

        let mut request = Request::new(RequestType::ClientExit, &self.client);
        request.hash_code = self.hash_code;
        self.exited = true;
        self.journals.clear();
        self.transport.call(&request)?;

        tracing::debug!(client = %self.client, "client exited");
        Ok(())
    }
}

impl<T: Transport, L: PageLoader> PageProvider for ClientPageProvider<T, L> {
    fn register_journal(
        &mut self,
        folder: &str,
        name: &str,
    ) -> Result<JournalHandle, ProviderError> {
        let key = (folder.to_owned(), name.to_owned());
        if let Some(&index) = self.journals.get(&key) {
            tracing::debug!(client = %self.client, folder, name, index, "journal already bound");
            return Ok(JournalHandle {
                folder: key.0,
                name: key.1,
                slot: Some(index),
            });
        }

        let mut request = Request::new(RequestType::JournalRegister, &self.client);
        request.hash_code = self.hash_code;

        let index = match self.transport.call(&request)? {
            Reply::Journal(reply) if reply.success => usize::try_from(reply.comm_idx).ok(),
            _ => None,
        };

        let Some(index) = index else {
            tracing::error!(client = %self.client, folder, name, "failed to register journal");
            return Err(ProviderError::Registration {
                client: self.client.clone(),
            });
        };

        match self.comm.slot(index)?.bind(folder, name, self.is_writer) {
            Ok(()) => {}
            Err(CommError::NotOccupied(status)) => {
                tracing::error!(client = %self.client, index, ?status, "comm slot is not occupied");
                return Err(ProviderError::Registration {
                    client: self.client.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(client = %self.client, folder, name, index, "bound journal");
        self.journals.insert(key.clone(), index);
        Ok(JournalHandle {
            folder: key.0,
            name: key.1,
            slot: Some(index),
        })
    }

    fn acquire_page(
        &mut self,
        journal: &JournalHandle,
        page_number: i32,
    ) -> Result<Option<Page>, ProviderError> {
        let Some(index) = journal.slot else {
            return Err(ProviderError::Unbound {
                name: journal.name.clone(),
            });
        };

        let slot = self.comm.slot(index)?;
        slot.post_request(self.hash_code, page_number)?;

        match slot.wait_resolved(&self.wait)? {
            SlotStatus::Allocated => {}
            SlotStatus::Conflict => {
                tracing::error!(folder = %journal.folder, name = %journal.name, "more than one writer");
                return Err(ProviderError::WriterConflict {
                    folder: journal.folder.clone(),
                    name: journal.name.clone(),
                });
            }
            status => {
                tracing::debug!(name = %journal.name, page_number, ?status, "page not allocated");
                return Ok(None);
            }
        }

        let page = self.loader.load(
            journal.folder_path(),
            &journal.name,
            page_number,
            self.revise_allowed,
            true,
        )?;

        Ok(page)
    }

    fn release_page(&mut self, page: Page) -> Result<(), ProviderError> {
        Ok(self.loader.release(page, true)?)
    }

    fn is_writer(&self) -> bool {
        self.is_writer
    }

    fn revise_allowed(&self) -> bool {
        self.revise_allowed
    }
}

impl<T: Transport, L: PageLoader> Drop for ClientPageProvider<T, L> {
    fn drop(&mut self) {
        if let Err(err) = self.exit() {
            tracing::warn!(client = %self.client, %err, "failed to exit client");
        }
    }
}
