use std::path::PathBuf;

use thiserror::Error;

/// What a successfully registered client receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientGrant {
    /// The comm file the client maps.
    pub comm_file: PathBuf,
    pub file_size: u32,
    /// Token identifying this session in later requests.
    pub hash_code: u32,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client {0} is not registered")]
    UnknownClient(String),
    #[error("hash code {hash_code} does not identify the live session of {name}")]
    StaleSession { name: String, hash_code: u32 },
    #[error("no free comm slot")]
    NoFreeSlot,
    #[error("{0}")]
    Refused(String),
}

/// The bookkeeping service the dispatcher drives.
///
/// The dispatcher only calls these methods while holding the mutex it shares with the
/// allocator, so implementations need no locking of their own.
pub trait Registry: Send {
    fn register_client(
        &mut self,
        name: &str,
        pid: u32,
        is_writer: bool,
    ) -> Result<ClientGrant, RegistryError>;

    /// Occupy a comm slot for the session `(name, hash_code)` and return its index.
    fn register_journal(&mut self, name: &str, hash_code: u32) -> Result<usize, RegistryError>;

    /// Tear down a session. Unknown or stale sessions are ignored.
    fn exit_client(&mut self, name: &str, hash_code: u32);
}
