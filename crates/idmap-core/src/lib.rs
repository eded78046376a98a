//! # idmap-core
//!
//! Identity resolution between windows security identifiers and POSIX user
//! and group ids.
//!
//! A batch of [`MappingRequest`]s is resolved by [`resolve_batch`] against:
//!
//! - the fixed table of OS-defined principals ([`wellknown`])
//! - a persistent mapping and name cache with time-based expiry ([`cache`])
//! - administrator name rules with a deterministic priority order ([`rules`])
//! - an external directory, queried once per batch ([`directory`])
//! - ephemeral ids for principals with no durable mapping ([`ephemeral`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use idmap_core::{
//!     IdmapConfig, IdmapContext, MappingRequest, Sid, WorkerStores, init_stores,
//!     resolve_batch,
//! };
//!
//! let config = IdmapConfig::from_toml(r#"mapping_domain = "SFBAY""#)?;
//! init_stores(&config)?;
//! let ctx = IdmapContext::new(config.clone());
//!
//! // One per worker thread.
//! let mut stores = WorkerStores::new(&config);
//! let sid: Sid = "S-1-5-21-1-2-3-1104".parse()?;
//! let mut batch = [MappingRequest::sid_to_uid(sid)];
//! for result in resolve_batch(&ctx, &mut stores, &mut batch)? {
//!     println!("{:?} ({:?})", result.identity(), result.status);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Concurrency
//!
//! [`IdmapContext`] is shared by reference between workers. Store
//! connections are not: every worker owns a [`WorkerStores`] and the batch
//! state lives on that worker's stack for the duration of one call.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod ephemeral;
pub mod error;
pub mod nameservice;
pub mod pipeline;
pub mod request;
pub mod rules;
pub mod sid;
pub mod store;
pub mod wellknown;

pub use config::{BusyPolicy, ConfigError, IdmapConfig};
pub use context::{Clock, FixedClock, IdmapContext, SystemClock};
pub use directory::{DirectoryAnswer, DirectoryQuery, DirectoryReply, DirectoryService, NoDirectory};
pub use ephemeral::{EphemeralAllocator, IdAuthority, IdBlock, LocalIdAuthority};
pub use error::{IdmapError, PrincipalType, RuleDirection};
pub use nameservice::{NameService, SystemNameService};
pub use pipeline::{
    ResolvedMapping, U2wLookup, W2uLookup, get_u2w_mapping, get_w2u_mapping, resolve_batch,
};
pub use request::{MappingRequest, MappingResult, RequestFlags, SourceId};
pub use rules::{NameRule, RuleFilter, RuleRanks, RuleRecord};
pub use sid::{Direction, IdType, Identity, Sid};
pub use store::{StoreHandle, StoreInitReport, StoreKind, WorkerStores, init_stores};
