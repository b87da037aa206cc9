use std::path::PathBuf;

use paged_comm::WaitPolicy;
use paged_socket::{TransportConfig, UnixTransport, DEFAULT_SOCKET_PATH};

use crate::{
    ClientPageProvider, LocalPageProvider, MmapPageLoader, PageProvider, ProviderError,
    JOURNAL_PAGE_SIZE,
};

/// Where pages come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Topology {
    /// Map pages directly, without an engine.
    Local,
    /// Negotiate every page with the engine listening on the configured socket.
    #[default]
    Remote,
}

/// Everything needed to construct a provider.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub client: String,
    pub is_writer: bool,
    /// Readers that want to modify pages. Implied for writers.
    pub revise_requested: bool,
    pub topology: Topology,
    pub socket: PathBuf,
    pub transport: TransportConfig,
    pub wait: WaitPolicy,
    pub page_size: usize,
}

impl ProviderConfig {
    pub fn new(client: impl Into<String>, is_writer: bool) -> Self {
        ProviderConfig {
            client: client.into(),
            is_writer,
            revise_requested: false,
            topology: Topology::default(),
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            transport: TransportConfig::default(),
            wait: WaitPolicy::default(),
            page_size: JOURNAL_PAGE_SIZE,
        }
    }

    pub fn revise_allowed(&self) -> bool {
        self.is_writer || self.revise_requested
    }

    /// Construct the provider variant selected by `topology`.
    ///
    /// A remote provider registers with the engine right away.
    pub fn build(&self) -> Result<Box<dyn PageProvider + Send>, ProviderError> {
        let loader = MmapPageLoader::new(self.page_size);

        Ok(match self.topology {
            Topology::Local => Box::new(LocalPageProvider::new(
                loader,
                self.is_writer,
                self.revise_requested,
            )),
            Topology::Remote => {
                let transport = UnixTransport::new(&self.socket, self.transport);
                let provider = ClientPageProvider::register(
                    &self.client,
                    self.is_writer,
                    self.revise_requested,
                    transport,
                    loader,
                )?;

                Box::new(provider.with_wait_policy(self.wait))
            }
        })
    }
}

#[test]
fn writers_may_revise() {
    let mut config = ProviderConfig::new("W1", true);
    assert!(config.revise_allowed());

    config.is_writer = false;
    assert!(!config.revise_allowed());
    config.revise_requested = true;
    assert!(config.revise_allowed());
}

#[test]
fn local_build_needs_no_engine() {
    let mut config = ProviderConfig::new("R1", false);
    config.topology = Topology::Local;
    config.socket = PathBuf::from("/nonexistent/paged.sock");

    let provider = config.build().unwrap();
    assert!(!provider.is_writer());
    assert!(!provider.revise_allowed());
}

#[test]
fn remote_build_fails_without_engine() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ProviderConfig::new("R1", false);
    config.socket = dir.path().join("paged.sock");

    assert!(matches!(config.build(), Err(ProviderError::Transport(_))));
}
