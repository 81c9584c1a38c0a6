//! Git object store access for svnbridge.

pub mod store;

pub use store::{CommitInfo, GitStore};
