/// Workflow domain: type definitions, SQLite persistence, and the
/// hot-reload registry.
pub mod registry;
pub mod storage;
pub mod types;
