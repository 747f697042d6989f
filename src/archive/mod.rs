//! Phase 1 raw archive: async disk writer (C2), minute-aligned binary
//! writer/reader (C3), and session boundary provenance tracking.

pub mod binary_writer;
pub mod disk_writer;
pub mod session_tracker;

pub use binary_writer::{BinaryArchiveReader, BinaryArchiveWriter};
pub use disk_writer::{AsyncDiskWriter, Priority, WriteRequest};
pub use session_tracker::SessionBoundaryTracker;
