//! In-process implementations of the collaborator ports.
//!
//! Used by the integration tests and the demo binary. Each one supports
//! fault injection so failure paths can be driven deterministically.

pub mod auth;
pub mod broadcast;
pub mod documents;
pub mod objects;

pub use auth::MemoryAuth;
pub use broadcast::{ChannelRegistry, CollectionChannel};
pub use documents::{MemoryDocumentStore, MemoryStoreConfig, WriteOp, WriteRecord};
pub use objects::MemoryObjectStorage;
