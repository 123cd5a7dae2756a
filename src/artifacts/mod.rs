//! Artifact trees: item model, provider contract, filesystem backend and
//! the engine that copies a tree between two providers.

pub mod copy;
mod engine;
mod filesystem;
mod item;
mod provider;

pub use engine::{ArtifactEngine, TransferOptions, TransferSummary};
pub use filesystem::FilesystemProvider;
pub use item::{
    ArtifactItem, DESTINATION_URL_KEY, DOWNLOAD_URL_KEY, ItemType, SYMLINK_TARGET_KEY,
};
pub use provider::{ArtifactProvider, ArtifactStream};
