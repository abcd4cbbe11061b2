/// Core data model: identifiers, observations, series and metadata records.
///
/// Local numeric ids are dense `u64`s assigned per physical store; they are
/// never exposed across a federation boundary without being packed into a
/// public id first (see [`crate::federation`]). Schema and encoding
/// descriptors are opaque JSON values: the engine only ever compares them
/// through the [`crate::codec::SchemaCompat`] checker.
use crate::time::Time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

macro_rules! local_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// The raw local id value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

local_id! {
    /// Local id of a system (sensor, process, platform).
    SystemId
}
local_id! {
    /// Local id of one datastream revision.
    DataStreamId
}
local_id! {
    /// Local id of one command stream revision.
    CommandStreamId
}
local_id! {
    /// Local id of a feature of interest.
    FoiId
}
local_id! {
    /// Local id of an observation series.
    SeriesId
}

impl SystemId {
    /// Sentinel used in parent filters meaning "top level / no parent".
    /// Real system ids start at 1.
    pub const NO_PARENT: SystemId = SystemId(0);
}

impl FoiId {
    /// Sentinel used in series keys for observations without a feature of
    /// interest. Real foi ids start at 1.
    pub const NONE: FoiId = FoiId(0);
}

/// A single time-stamped observation.
///
/// The result payload is opaque to the engine; its structure is described by
/// the owning datastream's schema descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// The datastream (revision) that produced this observation.
    pub datastream: DataStreamId,
    /// The sampled feature of interest, if any.
    pub foi: Option<FoiId>,
    /// When the observed phenomenon happened.
    pub phenomenon_time: Time,
    /// When the result was produced. Often equal to `phenomenon_time`.
    pub result_time: Time,
    /// The opaque result payload.
    pub result: JsonValue,
}

impl Observation {
    /// Create an observation whose result time equals its phenomenon time.
    pub fn new(datastream: DataStreamId, phenomenon_time: Time, result: JsonValue) -> Self {
        Self {
            datastream,
            foi: None,
            phenomenon_time,
            result_time: phenomenon_time,
            result,
        }
    }

    /// Attach a feature of interest.
    pub fn with_foi(mut self, foi: FoiId) -> Self {
        self.foi = Some(foi);
        self
    }

    /// Set an explicit result time.
    pub fn with_result_time(mut self, result_time: Time) -> Self {
        self.result_time = result_time;
        self
    }

    /// The result-time bucket this observation's series groups under:
    /// [`Time::MAX`] when result time tracks phenomenon time, the literal
    /// result time otherwise.
    pub fn result_time_bucket(&self) -> Time {
        if self.result_time == self.phenomenon_time {
            Time::MAX
        } else {
            self.result_time
        }
    }

    /// The foi id as stored in series keys (`FoiId::NONE` when absent).
    pub fn foi_or_none(&self) -> FoiId {
        self.foi.unwrap_or(FoiId::NONE)
    }
}

/// The grouping key of a series: one series per distinct combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// The producing datastream.
    pub datastream: DataStreamId,
    /// The feature of interest (`FoiId::NONE` when absent).
    pub foi: FoiId,
    /// The result-time bucket ([`Time::MAX`] = "tracks phenomenon time").
    pub result_time_bucket: Time,
}

/// Stored reverse mapping from a series id back to its grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    /// The grouping key this series was created for.
    pub key: SeriesKey,
}

/// Outcome of an add-or-update operation on versioned metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No previous revision existed; a new record was inserted.
    Added,
    /// The existing revision was overwritten in place (no new version).
    Replaced,
    /// An incompatible change on a revision with recorded data produced a
    /// brand-new revision; history is preserved.
    NewRevision,
    /// Nothing changed; the existing record was left untouched.
    Unchanged,
}

/// One valid-time revision of a datastream's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamInfo {
    /// The producing system.
    pub system: SystemId,
    /// The system output this datastream carries. Unique per system at any
    /// instant; revisions share it.
    pub output_name: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque structural schema descriptor. Its embedded output name (the
    /// top-level `"name"` field, when present) must equal `output_name`.
    pub schema: JsonValue,
    /// Opaque encoding descriptor.
    pub encoding: JsonValue,
    /// When this revision becomes valid.
    pub valid_start: Time,
    /// When this revision stops being valid: the next revision's start, or
    /// `None` for "until superseded". Computed on read, never stored.
    #[serde(skip)]
    pub valid_end: Option<Time>,
}

impl DataStreamInfo {
    /// Create a revision valid from now.
    pub fn new(system: SystemId, output_name: impl Into<String>) -> Self {
        let output_name = output_name.into();
        Self {
            system,
            name: output_name.clone(),
            output_name,
            description: String::new(),
            schema: JsonValue::Null,
            encoding: JsonValue::Null,
            valid_start: Time::now(),
            valid_end: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the schema descriptor.
    pub fn with_schema(mut self, schema: JsonValue) -> Self {
        self.schema = schema;
        self
    }

    /// Set the encoding descriptor.
    pub fn with_encoding(mut self, encoding: JsonValue) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the valid-time start.
    pub fn with_valid_start(mut self, valid_start: Time) -> Self {
        self.valid_start = valid_start;
        self
    }
}

/// One valid-time revision of a command stream's metadata.
///
/// Mirrors [`DataStreamInfo`] with a control name instead of an output name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStreamInfo {
    /// The receiving system.
    pub system: SystemId,
    /// The control input this command stream feeds.
    pub control_name: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque structural schema descriptor for command parameters.
    pub schema: JsonValue,
    /// Opaque encoding descriptor.
    pub encoding: JsonValue,
    /// When this revision becomes valid.
    pub valid_start: Time,
    /// Computed on read, never stored.
    #[serde(skip)]
    pub valid_end: Option<Time>,
}

impl CommandStreamInfo {
    /// Create a revision valid from now.
    pub fn new(system: SystemId, control_name: impl Into<String>) -> Self {
        let control_name = control_name.into();
        Self {
            system,
            name: control_name.clone(),
            control_name,
            description: String::new(),
            schema: JsonValue::Null,
            encoding: JsonValue::Null,
            valid_start: Time::now(),
            valid_end: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the schema descriptor.
    pub fn with_schema(mut self, schema: JsonValue) -> Self {
        self.schema = schema;
        self
    }

    /// Set the encoding descriptor.
    pub fn with_encoding(mut self, encoding: JsonValue) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the valid-time start.
    pub fn with_valid_start(mut self, valid_start: Time) -> Self {
        self.valid_start = valid_start;
        self
    }
}

/// One valid-time revision of a system description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Globally unique, stable identifier (URN or UUID string).
    pub uid: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// The group this system is a member of, if any.
    pub parent: Option<SystemId>,
    /// When this revision becomes valid.
    pub valid_start: Time,
    /// Computed on read, never stored.
    #[serde(skip)]
    pub valid_end: Option<Time>,
}

impl SystemInfo {
    /// Create a system description with the given unique id.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: String::new(),
            description: String::new(),
            parent: None,
            valid_start: Time::now(),
            valid_end: None,
        }
    }

    /// Create a system description with a generated UUID uid.
    pub fn generated() -> Self {
        Self::new(format!("urn:uuid:{}", uuid::Uuid::new_v4()))
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the parent group.
    pub fn with_parent(mut self, parent: SystemId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the valid-time start.
    pub fn with_valid_start(mut self, valid_start: Time) -> Self {
        self.valid_start = valid_start;
        self
    }
}

/// One valid-time revision of a feature-of-interest description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoiInfo {
    /// Globally unique, stable identifier.
    pub uid: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// The system this feature is associated with, if any.
    pub parent_system: Option<SystemId>,
    /// When this revision becomes valid.
    pub valid_start: Time,
    /// Computed on read, never stored.
    #[serde(skip)]
    pub valid_end: Option<Time>,
}

impl FoiInfo {
    /// Create a feature description with the given unique id.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: String::new(),
            description: String::new(),
            parent_system: None,
            valid_start: Time::now(),
            valid_end: None,
        }
    }

    /// Create a feature description with a generated UUID uid.
    pub fn generated() -> Self {
        Self::new(format!("urn:uuid:{}", uuid::Uuid::new_v4()))
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the associated system.
    pub fn with_parent_system(mut self, system: SystemId) -> Self {
        self.parent_system = Some(system);
        self
    }

    /// Set the valid-time start.
    pub fn with_valid_start(mut self, valid_start: Time) -> Self {
        self.valid_start = valid_start;
        self
    }
}
