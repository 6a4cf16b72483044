//! # Bundle storage driver contract
//!
//! The pluggable backend interface the registry engine uses for all content
//! access, abstracting away the physical storage medium (bundle archives, a
//! local directory tree, or memory).

mod driver;
mod error;

pub use driver::{read_only, Driver, FileInfo, Reader, Writer};
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
