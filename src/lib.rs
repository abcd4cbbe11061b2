//! # SensorHub — federated time-series observation storage
//!
//! SensorHub stores time-stamped sensor observations grouped into series,
//! versions every piece of metadata over valid time, and federates any
//! number of physical stores behind one query surface:
//!
//! - **Series-grouped observations** - one series per (datastream, feature,
//!   result-time bucket) combination, keyed by phenomenon time
//! - **Versioned metadata** - systems, datastreams, command streams and
//!   features of interest keep their full revision history
//! - **Composable filters** - builder-style filters with nested
//!   cross-resource dimensions, free-text keywords and time ranges
//! - **Federation** - collision-free public ids and lazy, time-ordered
//!   merging across stores
//!
//! ## Quick Start
//!
//! ```ignore
//! use sensorhub::prelude::*;
//!
//! fn main() -> HubResult<()> {
//!     let hub = SensorHub::with_defaults();
//!     let db = hub.register_database(1)?;
//!     let handlers = hub.require_handlers(1)?;
//!
//!     // Register a system and one of its outputs.
//!     let (sys, _) = handlers
//!         .systems()
//!         .add_or_update(SystemInfo::new("urn:x:station1").with_name("Weather station"))?;
//!     let (ds, _) = handlers.datastreams().add_or_update(
//!         DataStreamInfo::new(sys, "temp").with_schema(json!({"name": "temp"})),
//!     )?;
//!
//!     // Record and query observations.
//!     db.add_observation(Observation::new(ds, Time::now(), json!(21.5)))?;
//!     let filter = ObsFilter::all().with_datastreams(
//!         DataStreamFilter::all()
//!             .with_systems(SystemFilter::all().with_keywords(["weather"])),
//!     );
//!     for (key, obs) in hub.federation().select_observations(&filter)? {
//!         println!("{key}: {:?}", obs.result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The engine is layered bottom-up:
//!
//! 1. **Ordered storage** (`kv`, `keys`, `codec`) - one checkpointed ordered
//!    byte map per physical store, composite byte-sortable keys, a versioned
//!    record codec
//! 2. **Resource stores** (`series`, `observations`, `metadata`) - the
//!    series index, the observation store and the four versioned metadata
//!    stores, all sharing one map
//! 3. **Database** (`database`) - nested filter resolution and compound
//!    cascading mutations over one store
//! 4. **Hub surface** (`federation`, `transactions`, `events`, `hub`) -
//!    public-id translation and merged queries, uid-addressed mutation
//!    handlers, hierarchical lifecycle events
//!
//! ## Thread Safety
//!
//! Every handle ([`SensorHub`], [`LocalDatabase`], the stores, the event
//! bus) clones cheaply and is safe to share across threads; readers run
//! concurrently and compound mutations are atomic per physical store.

pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod federation;
pub mod filter;
pub mod hub;
pub mod keys;
pub mod merge;
pub mod metadata;
pub mod observations;
pub mod series;
pub mod time;
pub mod transactions;
pub mod types;

// Internal plumbing
mod fulltext;
mod kv;

// Public API exports
pub use config::HubConfig;
pub use database::LocalDatabase;
pub use error::{HubError, HubResult};
pub use hub::SensorHub;

pub use filter::{
    CommandStreamFilter, DataStreamFilter, FoiFilter, ObsFilter, ObsPredicate, SystemFilter,
    TemporalFilter,
};
pub use keys::ObsKey;
pub use time::{Time, TimeExtent};
pub use types::{
    CommandStreamId, CommandStreamInfo, DataStreamId, DataStreamInfo, FoiId, FoiInfo, Observation,
    SeriesId, SeriesKey, SystemId, SystemInfo, UpdateOutcome,
};

pub use events::{EventBus, EventKind, HubEvent, ResourceKind};
pub use federation::{DbNum, FederatedDatabase, FederatedObsKey};
pub use metadata::{CommandStreamStore, DataStreamStore, FoiStore, SystemStore};
pub use observations::{ObsStream, ObservationStore};
pub use transactions::{
    CommandStreamHandler, DataStreamHandler, DatabaseHandlers, FoiHandler, SystemHandler,
};

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use sensorhub::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::database::LocalDatabase;
    pub use crate::error::{HubError, HubResult};
    pub use crate::events::{EventBus, EventKind, HubEvent, ResourceKind};
    pub use crate::federation::{DbNum, FederatedDatabase, FederatedObsKey};
    pub use crate::filter::{
        CommandStreamFilter, DataStreamFilter, FoiFilter, ObsFilter, SystemFilter, TemporalFilter,
    };
    pub use crate::hub::SensorHub;
    pub use crate::keys::ObsKey;
    pub use crate::time::{Time, TimeExtent};
    pub use crate::transactions::DatabaseHandlers;
    pub use crate::types::{
        CommandStreamInfo, DataStreamInfo, FoiInfo, Observation, SystemInfo, UpdateOutcome,
    };
    pub use serde_json::{Value as JsonValue, json};
}
