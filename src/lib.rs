// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod convert;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod gateway;   // MirrorVenue + PaperVenue
pub mod locks;
pub mod metrics;
pub mod notifier;
pub mod recorder;
pub mod retry;
pub mod scheduler;
pub mod source;    // SnapshotProvider: REST / mock / scripted
pub mod store;
