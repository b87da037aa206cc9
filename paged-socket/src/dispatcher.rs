use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::protocol::{ClientReply, ClockReply, ExitReply, JournalReply, Reply, Request, RequestType};
use crate::registry::Registry;
use crate::transport::{read_frame, write_frame};

/// Turns one raw request into one raw reply.
///
/// This is the socket-free half of the [`Dispatcher`], usable for in-process exchanges.
pub struct RequestHandler<R, C = SystemClock> {
    registry: Arc<Mutex<R>>,
    clock: C,
    served: AtomicU64,
}

impl<R: Registry, C: Clock> RequestHandler<R, C> {
    /// Handle requests against a registry whose mutex is shared with the allocator.
    pub fn new(registry: Arc<Mutex<R>>, clock: C) -> Self {
        RequestHandler {
            registry,
            clock,
            served: AtomicU64::new(0),
        }
    }

    /// Number of well-formed requests handled so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Returns `None` for a message that must not be answered.
    pub fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Request::decode(raw) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%err, len = raw.len(), "dropping malformed request");
                return None;
            }
        };

        self.served.fetch_add(1, Ordering::Relaxed);
        let reply = {
            let mut registry = self.registry.lock();
            self.dispatch(&mut registry, &request)
        };

        match reply.encode() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!(%err, client = %request.name, kind = ?request.kind, "failed to encode reply");
                let Reply::Client(granted) = reply else {
                    return None;
                };

                // The client never learns its hash code, drop the session it can not use.
                self.registry
                    .lock()
                    .exit_client(&request.name, granted.hash_code);
                Reply::Client(ClientReply::refused(granted.kind)).encode().ok()
            }
        }
    }

    fn dispatch(&self, registry: &mut R, request: &Request) -> Reply {
        let name = request.name.as_str();

        match request.kind {
            RequestType::ClockQuery => Reply::Clock(ClockReply {
                sec_diff: self.clock.sec_diff(),
                nano: self.clock.nano(),
            }),
            kind @ (RequestType::WriterRegister | RequestType::ReaderRegister) => {
                let is_writer = kind == RequestType::WriterRegister;

                let grant = match registry.register_client(name, request.pid, is_writer) {
                    Ok(grant) => grant,
                    Err(err) => {
                        tracing::warn!(client = name, pid = request.pid, %err, "client registration refused");
                        return Reply::Client(ClientReply::refused(kind));
                    }
                };

                tracing::info!(client = name, pid = request.pid, is_writer, "client registered");
                Reply::Client(ClientReply {
                    kind,
                    success: true,
                    comm_file: grant.comm_file.to_string_lossy().into_owned(),
                    file_size: grant.file_size,
                    hash_code: grant.hash_code,
                })
            }
            RequestType::JournalRegister => {
                let idx = registry
                    .register_journal(name, request.hash_code)
                    .map_err(|err| {
                        tracing::warn!(client = name, %err, "journal registration refused");
                    })
                    .ok()
                    .and_then(|idx| i32::try_from(idx).ok());

                Reply::Journal(JournalReply {
                    success: idx.is_some(),
                    comm_idx: idx.unwrap_or(-1),
                })
            }
            RequestType::ClientExit => {
                registry.exit_client(name, request.hash_code);
                tracing::info!(client = name, "client exited");
                Reply::Exit(ExitReply { success: true })
            }
        }
    }
}

/// The engine's control plane: a single-threaded accept, handle, reply loop.
pub struct Dispatcher<R, C = SystemClock> {
    handler: RequestHandler<R, C>,
    listener: Arc<UnixListener>,
    path: PathBuf,
    running: Arc<AtomicBool>,
    io_timeout: Duration,
}

/// Ends [`Dispatcher::run`] from any thread.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    listener: Arc<UnixListener>,
}

impl<R: Registry> Dispatcher<R> {
    pub fn bind(path: impl AsRef<Path>, registry: Arc<Mutex<R>>) -> Result<Self, std::io::Error> {
        Self::with_clock(path, registry, SystemClock::new())
    }
}

impl<R: Registry, C: Clock> Dispatcher<R, C> {
    /// Create the endpoint at `path`, including missing parent directories.
    ///
    /// A socket file left behind by an earlier engine is replaced.
    pub fn with_clock(
        path: impl AsRef<Path>,
        registry: Arc<Mutex<R>>,
        clock: C,
    ) -> Result<Self, std::io::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => tracing::warn!(path = %path.display(), "replaced stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(path)?;

        Ok(Dispatcher {
            handler: RequestHandler::new(registry, clock),
            listener: Arc::new(listener),
            path: path.to_owned(),
            running: Arc::new(AtomicBool::new(true)),
            io_timeout: Duration::from_secs(1),
        })
    }

    /// Bound on reading a request and writing its reply, so one stuck client can not stall the
    /// loop.
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handler(&self) -> &RequestHandler<R, C> {
        &self.handler
    }

    pub fn served(&self) -> u64 {
        self.handler.served()
    }

    /// Process one raw request in-process, see [`RequestHandler::handle`].
    pub fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        self.handler.handle(raw)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
            listener: self.listener.clone(),
        }
    }

    /// Serve requests until stopped.
    ///
    /// Failures of a single exchange are logged and never end the loop.
    pub fn run(&self) {
        tracing::info!(path = %self.path.display(), "serving control plane");

        let mut failures = 0;
        while self.running.load(Ordering::Acquire) {
            let mut stream = match self.listener.accept() {
                Ok((stream, _)) => {
                    failures = 0;
                    stream
                }
                Err(err) => {
                    if self.running.load(Ordering::Acquire) {
                        failures += 1;
                        tracing::error!(%err, failures, "accept failed");
                        std::thread::sleep(accept_backoff(failures));
                    }
                    continue;
                }
            };

            if let Err(err) = stream
                .set_read_timeout(Some(self.io_timeout))
                .and_then(|()| stream.set_write_timeout(Some(self.io_timeout)))
            {
                tracing::error!(%err, "failed to configure connection");
                continue;
            }

            let request = match read_frame(&mut stream) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(%err, "failed to receive request");
                    continue;
                }
            };

            let Some(reply) = self.handler.handle(&request) else {
                continue;
            };

            if let Err(err) = write_frame(&mut stream, &reply) {
                tracing::error!(%err, "failed to send reply");
            }
        }

        tracing::info!(served = self.served(), "control plane stopped");
    }
}

/// Pause after `failures` accept errors in a row, e.g. while out of file descriptors.
fn accept_backoff(failures: u32) -> Duration {
    const FIRST: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_millis(100);

    FIRST
        .checked_mul(1 << failures.saturating_sub(1).min(16))
        .map_or(MAX, |pause| pause.min(MAX))
}

#[test]
fn accept_backoff_doubles_up_to_cap() {
    assert_eq!(accept_backoff(1), Duration::from_millis(1));
    assert_eq!(accept_backoff(2), Duration::from_millis(2));
    assert_eq!(accept_backoff(5), Duration::from_millis(16));
    assert_eq!(accept_backoff(8), Duration::from_millis(100));
    assert_eq!(accept_backoff(u32::MAX), Duration::from_millis(100));
}

impl<R, C> Drop for Dispatcher<R, C> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl StopHandle {
    /// Interrupts a pending accept. Clients waiting for a reply see their connection dropped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // Shutting down the listening socket wakes the blocked `accept` with an error.
        unsafe { libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR) };
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
