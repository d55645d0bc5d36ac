//! # bar — BAR backup archiver core
//!
//! Archive engine guarantees (frozen in format version 1):
//! - All multi-byte integers on the wire are big-endian; never negotiated
//! - Every record is a self-delimiting chunk: 4-byte ASCII id, 64-bit length
//! - A truncated chunk header is end-of-archive; a length past the storage
//!   bounds is corruption
//! - Entry payloads stream through delta → byte-compression → cipher into a
//!   DATA sub-chunk; every fragment decodes standalone
//! - Each volume of a split archive restarts with the full prologue and is
//!   a readable archive prefix on its own
//! - SIGN chunks cover exactly the bytes since the previous signature (or
//!   volume start) up to their own header
//! - Session keys live in zeroized memory and are wiped on close

pub mod archive;
pub mod chunks;
pub mod compress;
pub mod configvalues;
pub mod crypt;
pub mod delta;
pub mod entries;
pub mod errors;
pub mod fragments;
pub mod fsio;
pub mod signature;
pub mod storage;
pub mod workers;

// Flat re-exports for the most common types.
pub use archive::{
    open_payload, verify_signatures, ArchiveMeta, ArchiveOptions, ArchiveReader, ArchiveWriter,
    CancelFlag, CreateKeys, EntryPayload, EntrySpec, EntryStart, OpenKeys,
};
pub use compress::ByteAlgorithm;
pub use crypt::CryptAlgorithm;
pub use entries::{EntryExt, EntryHeader, EntryKind, FileInfo, SpecialKind};
pub use errors::{Error, Result};
pub use fragments::FragmentRegistry;
pub use signature::SignatureState;
pub use storage::{FileStorage, MemoryStorage, ReadViewFactory, Storage};
