//! The communication table shared between a page engine and its journal clients.
//!
//! The engine creates one file-backed table of [`CommSlot`]s and every client maps the same file.
//! A slot binds one client to one journal. After binding, the client asks for pages by writing a
//! page number into its slot and flipping the status to `Requesting`; an allocator running
//! elsewhere resolves the request by moving the status to `Allocated`, `Conflict` or `Denied`.
//! No system call is involved in this exchange.
//!
//! ```text
//!           engine                      client                      allocator
//!  Raw ──occupy──▶ Occupied ──bind──▶ Holding ──post_request──▶ Requesting ──resolve──▶ Allocated
//!                                        ▲                                             │ Conflict
//!                                        └──────────── next request ◀──────────────────┘ Denied
//! ```
//!
//! ## Memory model
//!
//! The status word is the single synchronization variable of a slot. Every field a party writes
//! (folder, name, role, page number) is stored before the status is published with `Release`,
//! and every status observation uses `Acquire`. All fields are atomics, the mapping is shared by
//! processes that do not trust each other to uphold Rust's aliasing rules, so plain memory is never
//! handed out.
//!
//! A zeroed file is a valid table in which all slots are `Raw`.
mod slot;
mod table;
mod wait;

pub use slot::{CommSlot, SlotStatus, FOLDER_MAX_LENGTH, NAME_MAX_LENGTH};
pub use table::{CommTable, MAX_COMM_SLOTS};
pub use wait::WaitPolicy;

/// Failures of the slot protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommError {
    /// The slot index does not exist in this table.
    OutOfBounds { index: usize, len: usize },
    /// Binding a slot requires the engine to have occupied it first.
    NotOccupied(SlotStatus),
    /// Requests can only be posted on a bound slot without an outstanding request.
    NotBound(SlotStatus),
    /// The slot was reclaimed and now belongs to another session.
    NotOwner { expected: u32, actual: u32 },
    /// The text does not fit the fixed-size field, including its terminator.
    TextTooLong { len: usize, max: usize },
    /// Text fields are NUL-terminated and must not contain NUL themselves.
    InvalidText,
    /// The mapped file does not have the size the engine announced.
    UnfittingLayout { expected: usize, actual: usize },
    /// The allocator did not resolve the request within the wait policy.
    Timeout,
}

impl core::fmt::Display for CommError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CommError::OutOfBounds { index, len } => {
                write!(f, "comm slot {index} is out of bounds for a table of {len}")
            }
            CommError::NotOccupied(status) => {
                write!(f, "comm slot is {status:?}, expected it to be occupied")
            }
            CommError::NotBound(status) => {
                write!(f, "comm slot is {status:?}, it can not accept a page request")
            }
            CommError::NotOwner { expected, actual } => {
                write!(f, "comm slot belongs to session {actual:#x}, not {expected:#x}")
            }
            CommError::TextTooLong { len, max } => {
                write!(f, "text of {len} bytes exceeds the field limit of {max}")
            }
            CommError::InvalidText => write!(f, "text contains a NUL byte"),
            CommError::UnfittingLayout { expected, actual } => {
                write!(f, "comm file has {actual} bytes, expected {expected}")
            }
            CommError::Timeout => write!(f, "page request was not resolved in time"),
        }
    }
}

impl std::error::Error for CommError {}
