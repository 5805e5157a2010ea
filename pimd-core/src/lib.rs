//! Core of the pimd personal-data backend engine.
//!
//! This crate provides:
//! - [`Backend`]: the operation surface over one calendar, task or memo
//!   source, with opid-correlated results and cancellation
//! - [`DispatchQueue`]: the worker pool that orders blocking and
//!   non-blocking operations
//! - [`ChangeNotifier`]: batched change delivery to live views
//! - [`MetaSyncEngine`]: an offline-capable backend built from a
//!   [`Connector`] and an [`ObjectCache`]
//! - `provider`: a connector that talks to `pimd-provider-*` binaries

pub mod backend;
pub mod cache;
pub mod component;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ics;
pub mod meta;
pub mod notify;
pub mod operation;
pub mod provider;
pub mod query;
pub mod timezone;

pub use backend::{
    Backend, BackendEvent, BackendOps, BackendProperty, BackendSettings, BackendState,
    ConflictResolution, ObjModType, OpContext, OperationFlags,
};
pub use cache::{FileCache, MemoryCache, ObjectCache, ObjectDescriptor};
pub use component::{Component, ComponentId, ComponentKind, Property};
pub use config::{GlobalConfig, SourceConfig};
pub use dispatch::DispatchQueue;
pub use error::{BackendError, BackendResult, ErrorKind};
pub use meta::{Connector, MetaSettings, MetaSyncEngine};
pub use notify::{ChangeEvent, ChangeNotifier, View, ViewNotification, ViewReceiver};
pub use operation::{OpId, OperationHandle, Reply};
pub use query::Query;
pub use timezone::TimezoneCache;
