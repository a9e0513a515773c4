pub mod error;
pub mod file_cache;
pub mod mime;
pub mod mirror;
pub mod models;
pub mod pattern;
pub mod remote;
pub mod reply;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;
