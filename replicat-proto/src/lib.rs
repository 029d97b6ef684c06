pub mod catalog;
pub mod entry;
pub mod errors;
pub mod event;
pub mod hash;
pub mod node;

pub(crate) mod bytes;

pub use catalog::{
    decode_catalog, decode_requested_paths, dir_tree_of, encode_catalog, encode_requested_paths,
    DirTreeMap, RequestedPaths,
};
pub use entry::Entry;
pub use errors::{ProtoError, Result};
pub use event::{Event, EventKind};
pub use hash::{
    content_hash, content_hash_file, upload_digest, upload_digest_bytes, CONTENT_HASH_LEN,
};
pub use node::{NodeDescriptor, NodeMap, NodeStatus};
