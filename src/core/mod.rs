pub mod archive;
pub mod comparator;
pub mod engine;
pub mod exclusion;
pub mod fingerprint;
pub mod strategy;
pub mod transport;
pub mod tree;

pub use archive::{apply_archive, build_archive, AppliedChangeSet, BuiltArchive, Manifest};
pub use comparator::{diff, ChangeSet};
pub use engine::{PushEngine, PushReport, PushStatus};
pub use exclusion::ExclusionRules;
pub use fingerprint::{calculate_hash, scan, FingerprintStore, ProjectSnapshot};
pub use strategy::{choose, TransferKind};
pub use transport::{device_addr, AckReply, ArchiveSink, IncomingArchive, ReceiverServer, TcpSender};
pub use tree::format_file_tree;
