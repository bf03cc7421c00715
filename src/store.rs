//! Persistent per-entity caches.

pub mod datastore;

pub use datastore::JsonDatastore;
