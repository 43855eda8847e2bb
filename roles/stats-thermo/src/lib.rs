pub mod api;
pub mod backend;
pub mod ingest_handler;
