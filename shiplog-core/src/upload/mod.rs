//! The upload side of the pipeline: device credentials, the object-store
//! transport, the connection-managing uploader, and the dead letter.

pub mod credentials;
pub mod dead_letter;
pub mod store;
pub mod uploader;

pub use credentials::{
    ConnectionString, Credential, CredentialProvider, SasCredentialProvider,
    StaticCredentialProvider,
};
pub use dead_letter::{DeadLetterInventory, DeadLetterMeta, DeadLetterStore};
pub use store::{HttpObjectStore, MemoryObjectStore, ObjectStoreClient};
pub use uploader::{ConnectionState, UploadReceipt, Uploader};
