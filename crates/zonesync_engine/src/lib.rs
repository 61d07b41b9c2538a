//! # ZoneSync Engine
//!
//! Bidirectional sync between a local object graph and a zoned record store
//! with change-token feeds.
//!
//! This crate provides:
//! - Service attribute discovery per entity type
//! - Object ↔ record conversion with deferred reference resolution
//! - Push of locally committed changes, batched per database scope
//! - Pull of remote changes in committed rounds with token persistence
//! - A dependency-aware task queue with cancellation
//! - In-memory local and remote stores for tests and embedding
//!
//! ## Architecture
//!
//! The engine keeps one [`TokenLedger`](zonesync_protocol::TokenLedger) of
//! change tokens, persisted in the local store's metadata:
//! 1. Pull fetches the zones changed in a scope, then each zone round by round
//! 2. Every round and its new zone token are committed in one transaction
//! 3. Push uploads objects changed under the push context and stores the
//!    returned system fields once the remote store acknowledged them
//!
//! ## Key Invariants
//!
//! - A token is never persisted ahead of the data it covers
//! - Push cycles and pull rounds never overlap on one store
//! - Applying the same record twice yields the same local state
//! - Conflicts are reported, never merged silently

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attributes;
mod config;
mod context;
mod converter;
mod delegate;
mod engine;
mod error;
mod memory_remote;
mod memory_store;
mod model;
mod pull;
mod push;
mod remote;
mod scheduler;
mod store;

pub use attributes::{AttributeResolver, Resolution, ServiceAttributeNames, ServiceRole};
pub use config::{DefaultAttributeNames, RetryConfig, SyncConfig};
pub use converter::{
    Conversion, Converter, MissingReferenceSet, MissingReferences, PreparedRecord, StagedAssets,
};
pub use delegate::{NoopDelegate, SyncDelegate};
pub use engine::{EngineState, SyncEngine, SyncStats};
pub use error::{ErrorKind, SyncError, SyncResult, SyncStage};
pub use memory_remote::{MemoryRemote, RemoteOp};
pub use memory_store::{MemoryStore, MemoryTransaction, COMMIT_LOG_CAPACITY};
pub use model::{
    AttributeDescription, AttributeKind, AttributeValue, EntityDescription, LocalObject,
    LocalObjectId, ObjectModel, Predicate, RelationshipDescription, UserInfo, USER_INFO_ASSET,
    USER_INFO_SYNC_ENABLED, USER_INFO_SYNC_SCOPES, USER_INFO_SYNC_TYPE,
};
pub use pull::{DeleteRequestId, PullResult, ScopePhase, ZonePhase};
pub use push::{PushOutcome, PushReport, PushState};
pub use remote::{RemoteError, RemoteStore, ZoneProvisioner};
pub use scheduler::{TaskHandle, TaskId, TaskQueue, TaskStatus};
pub use store::{CommitEvent, LocalStore, LocalTransaction, StoreError, UpdatedObject};
