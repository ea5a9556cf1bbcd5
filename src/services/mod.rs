//! The release pipeline and the stores it talks to.

pub mod archive;
pub mod blob_store;
pub mod dedup;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod metadata_store;
pub mod registrar;
pub mod release_service;
