use std::collections::hash_map::{Entry, RandomState};
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};

use paged_comm::{CommTable, SlotStatus};
use paged_socket::{ClientGrant, Registry, RegistryError};

/// Name of the comm file inside the engine's base directory.
pub const COMM_FILE_NAME: &str = "comm";

/// A registered client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    pub pid: u32,
    pub hash_code: u32,
    pub is_writer: bool,
}

/// Sessions and comm slots of a running engine.
///
/// The comm file lives as long as the registry.
pub struct EngineRegistry {
    comm_file: PathBuf,
    table: CommTable,
    clients: HashMap<String, Session>,
    hasher: RandomState,
    issued: u64,
}

impl EngineRegistry {
    /// Create a fresh comm file in `base_dir`.
    pub fn create(base_dir: &Path) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(base_dir)?;
        let comm_file = base_dir.join(COMM_FILE_NAME);
        let table = CommTable::create(&comm_file)?;

        tracing::info!(comm_file = %comm_file.display(), slots = table.len(), "created comm table");
        Ok(EngineRegistry {
            comm_file,
            table,
            clients: HashMap::new(),
            hasher: RandomState::new(),
            issued: 0,
        })
    }

    pub fn comm_file(&self) -> &Path {
        &self.comm_file
    }

    pub fn table(&self) -> &CommTable {
        &self.table
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.clients.get(name)
    }

    pub fn sessions(&self) -> usize {
        self.clients.len()
    }

    /// Never zero, zero marks a slot without owner.
    fn issue_hash_code(&mut self, name: &str, pid: u32) -> u32 {
        loop {
            self.issued += 1;
            let hash = self.hasher.hash_one((name, pid, self.issued)) as u32;
            if hash != 0 {
                return hash;
            }
        }
    }

    /// Free all slots occupied for the session `hash_code`.
    fn reclaim(&self, hash_code: u32) -> usize {
        let mut reclaimed = 0;
        for slot in self.table.slots() {
            if slot.status() != SlotStatus::Raw && slot.owner() == hash_code {
                slot.reclaim();
                reclaimed += 1;
            }
        }

        reclaimed
    }
}

impl Registry for EngineRegistry {
    fn register_client(
        &mut self,
        name: &str,
        pid: u32,
        is_writer: bool,
    ) -> Result<ClientGrant, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::Refused("client name is empty".into()));
        }

        let hash_code = self.issue_hash_code(name, pid);
        let session = Session {
            pid,
            hash_code,
            is_writer,
        };

        if let Some(previous) = self.clients.insert(name.to_owned(), session) {
            let reclaimed = self.reclaim(previous.hash_code);
            tracing::warn!(client = name, previous = previous.pid, reclaimed, "replaced live session");
        }

        Ok(ClientGrant {
            comm_file: self.comm_file.clone(),
            file_size: CommTable::FILE_SIZE as u32,
            hash_code,
        })
    }

    fn register_journal(&mut self, name: &str, hash_code: u32) -> Result<usize, RegistryError> {
        match self.clients.get(name) {
            None => return Err(RegistryError::UnknownClient(name.to_owned())),
            Some(session) if session.hash_code != hash_code => {
                return Err(RegistryError::StaleSession {
                    name: name.to_owned(),
                    hash_code,
                })
            }
            Some(_) => {}
        }

        let index = self.table.occupy(hash_code).ok_or(RegistryError::NoFreeSlot)?;
        tracing::debug!(client = name, index, "occupied comm slot");
        Ok(index)
    }

    fn exit_client(&mut self, name: &str, hash_code: u32) {
        match self.clients.entry(name.to_owned()) {
            Entry::Occupied(entry) if entry.get().hash_code == hash_code => {
                entry.remove();
            }
            _ => {
                tracing::debug!(client = name, hash_code, "ignoring exit of unknown session");
                return;
            }
        }

        let reclaimed = self.reclaim(hash_code);
        tracing::debug!(client = name, reclaimed, "reclaimed comm slots");
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.comm_file) {
            tracing::warn!(comm_file = %self.comm_file.display(), %err, "failed to remove comm file");
        }
    }
}
