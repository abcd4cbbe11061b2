/// Resource filters: the query contract every store layer is built on.
///
/// Each resource kind gets a builder-style filter supporting an explicit
/// internal-id set, nested sub-resource filters, a time dimension, free-text
/// keywords, a result limit and (for observations) an opaque predicate over
/// the resolved value. Combining an explicit-id set with other dimensions is
/// id-set-wins: the ids drive retrieval and everything else post-filters the
/// decoded records.
use crate::error::{HubError, HubResult};
use crate::keys::ObsKey;
use crate::time::{Time, TimeExtent};
use crate::types::{CommandStreamId, DataStreamId, FoiId, Observation, SystemId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The time dimension of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalFilter {
    /// Absolute closed interval.
    Range(TimeExtent),
    /// Only the most recent result-time bucket per series (observations), or
    /// the latest revision per producer (metadata).
    Latest,
    /// The revision valid as of now.
    Current,
}

impl TemporalFilter {
    /// Range filter between two instants.
    pub fn between(begin: Time, end: Time) -> Self {
        Self::Range(TimeExtent::new(begin, end))
    }

    /// The interval this filter matches against, resolved at `now`.
    /// `Latest` has no interval; it is handled structurally by the stores.
    pub fn to_extent(self, now: Time) -> Option<TimeExtent> {
        match self {
            Self::Range(extent) => Some(extent),
            Self::Current => Some(TimeExtent::instant(now)),
            Self::Latest => None,
        }
    }
}

/// Filter over systems.
#[derive(Debug, Clone, Default)]
pub struct SystemFilter {
    /// Explicit internal ids; wins over every other dimension.
    pub internal_ids: Option<BTreeSet<SystemId>>,
    /// Match by stable unique id.
    pub uids: Option<BTreeSet<String>>,
    /// Parent group ids. May contain [`SystemId::NO_PARENT`] to select
    /// top-level systems, which forces a global scan under federation.
    pub parents: Option<BTreeSet<SystemId>>,
    /// Nested child-resource filter: only systems owning a matching
    /// datastream.
    pub datastreams: Option<Box<DataStreamFilter>>,
    /// Free-text keywords over name/description.
    pub keywords: Option<Vec<String>>,
    /// Valid-time dimension.
    pub valid_time: Option<TemporalFilter>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl SystemFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to explicit internal ids.
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = SystemId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict by unique id.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uids.get_or_insert_with(BTreeSet::new).insert(uid.into());
        self
    }

    /// Restrict by parent group.
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = SystemId>) -> Self {
        self.parents = Some(parents.into_iter().collect());
        self
    }

    /// Restrict to systems owning a datastream matching `filter`.
    pub fn with_datastreams(mut self, filter: DataStreamFilter) -> Self {
        self.datastreams = Some(Box::new(filter));
        self
    }

    /// Add free-text keywords.
    pub fn with_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Set the valid-time dimension.
    pub fn with_valid_time(mut self, tf: TemporalFilter) -> Self {
        self.valid_time = Some(tf);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the parent dimension contains the "no parent" sentinel.
    pub fn wants_top_level(&self) -> bool {
        self.parents
            .as_ref()
            .is_some_and(|p| p.contains(&SystemId::NO_PARENT))
    }

    /// Reject malformed combinations before any work happens.
    pub fn validate(&self) -> HubResult<()> {
        if matches!(self.valid_time, Some(TemporalFilter::Latest)) {
            // Latest is an observation result-time mode; metadata uses Current.
            return Err(HubError::validation(
                "valid-time filter on systems supports Range or Current, not Latest",
            ));
        }
        if let Some(ds) = &self.datastreams {
            ds.validate()?;
        }
        Ok(())
    }
}

/// Filter over datastreams.
#[derive(Debug, Clone, Default)]
pub struct DataStreamFilter {
    /// Explicit internal ids; wins over every other dimension.
    pub internal_ids: Option<BTreeSet<DataStreamId>>,
    /// Nested producer filter.
    pub systems: Option<Box<SystemFilter>>,
    /// Restrict by output name.
    pub output_names: Option<BTreeSet<String>>,
    /// Free-text keywords over name/description/schema labels.
    pub keywords: Option<Vec<String>>,
    /// Valid-time dimension.
    pub valid_time: Option<TemporalFilter>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl DataStreamFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to explicit internal ids.
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = DataStreamId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to datastreams produced by systems matching `filter`.
    pub fn with_systems(mut self, filter: SystemFilter) -> Self {
        self.systems = Some(Box::new(filter));
        self
    }

    /// Restrict by output name.
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_names
            .get_or_insert_with(BTreeSet::new)
            .insert(name.into());
        self
    }

    /// Add free-text keywords.
    pub fn with_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Set the valid-time dimension.
    pub fn with_valid_time(mut self, tf: TemporalFilter) -> Self {
        self.valid_time = Some(tf);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject malformed combinations before any work happens.
    pub fn validate(&self) -> HubResult<()> {
        if matches!(self.valid_time, Some(TemporalFilter::Latest)) {
            return Err(HubError::validation(
                "valid-time filter on datastreams supports Range or Current, not Latest",
            ));
        }
        if let Some(sys) = &self.systems {
            sys.validate()?;
        }
        Ok(())
    }
}

/// Filter over command streams. Mirrors [`DataStreamFilter`] with control
/// names instead of output names.
#[derive(Debug, Clone, Default)]
pub struct CommandStreamFilter {
    /// Explicit internal ids; wins over every other dimension.
    pub internal_ids: Option<BTreeSet<CommandStreamId>>,
    /// Nested receiver filter.
    pub systems: Option<Box<SystemFilter>>,
    /// Restrict by control name.
    pub control_names: Option<BTreeSet<String>>,
    /// Free-text keywords.
    pub keywords: Option<Vec<String>>,
    /// Valid-time dimension.
    pub valid_time: Option<TemporalFilter>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl CommandStreamFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to explicit internal ids.
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = CommandStreamId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to command streams received by systems matching `filter`.
    pub fn with_systems(mut self, filter: SystemFilter) -> Self {
        self.systems = Some(Box::new(filter));
        self
    }

    /// Restrict by control name.
    pub fn with_control_name(mut self, name: impl Into<String>) -> Self {
        self.control_names
            .get_or_insert_with(BTreeSet::new)
            .insert(name.into());
        self
    }

    /// Add free-text keywords.
    pub fn with_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Set the valid-time dimension.
    pub fn with_valid_time(mut self, tf: TemporalFilter) -> Self {
        self.valid_time = Some(tf);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject malformed combinations before any work happens.
    pub fn validate(&self) -> HubResult<()> {
        if matches!(self.valid_time, Some(TemporalFilter::Latest)) {
            return Err(HubError::validation(
                "valid-time filter on command streams supports Range or Current, not Latest",
            ));
        }
        if let Some(sys) = &self.systems {
            sys.validate()?;
        }
        Ok(())
    }
}

/// Filter over features of interest.
#[derive(Debug, Clone, Default)]
pub struct FoiFilter {
    /// Explicit internal ids; wins over every other dimension.
    pub internal_ids: Option<BTreeSet<FoiId>>,
    /// Match by stable unique id.
    pub uids: Option<BTreeSet<String>>,
    /// Nested parent-system filter. A parent id set containing
    /// [`SystemId::NO_PARENT`] selects unattached features.
    pub parent_systems: Option<Box<SystemFilter>>,
    /// Free-text keywords.
    pub keywords: Option<Vec<String>>,
    /// Valid-time dimension.
    pub valid_time: Option<TemporalFilter>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl FoiFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to explicit internal ids.
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = FoiId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict by unique id.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uids.get_or_insert_with(BTreeSet::new).insert(uid.into());
        self
    }

    /// Restrict to features attached to systems matching `filter`.
    pub fn with_parent_systems(mut self, filter: SystemFilter) -> Self {
        self.parent_systems = Some(Box::new(filter));
        self
    }

    /// Add free-text keywords.
    pub fn with_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Set the valid-time dimension.
    pub fn with_valid_time(mut self, tf: TemporalFilter) -> Self {
        self.valid_time = Some(tf);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject malformed combinations before any work happens.
    pub fn validate(&self) -> HubResult<()> {
        if matches!(self.valid_time, Some(TemporalFilter::Latest)) {
            return Err(HubError::validation(
                "valid-time filter on features supports Range or Current, not Latest",
            ));
        }
        if let Some(sys) = &self.parent_systems {
            sys.validate()?;
        }
        Ok(())
    }
}

/// Opaque predicate over resolved observations.
pub type ObsPredicate = Arc<dyn Fn(&Observation) -> bool + Send + Sync>;

/// Filter over observations.
#[derive(Clone, Default)]
pub struct ObsFilter {
    /// Explicit composite keys; wins over every other dimension.
    pub internal_ids: Option<Vec<ObsKey>>,
    /// Nested producer filter.
    pub datastreams: Option<DataStreamFilter>,
    /// Nested feature-of-interest filter.
    pub fois: Option<FoiFilter>,
    /// Phenomenon-time dimension (absolute ranges only).
    pub phenomenon_time: Option<TemporalFilter>,
    /// Result-time dimension. `Latest` selects only the most recent
    /// result-time bucket per series.
    pub result_time: Option<TemporalFilter>,
    /// Maximum number of results; enforced lazily during merge.
    pub limit: Option<usize>,
    /// Opaque predicate applied to each decoded observation.
    pub predicate: Option<ObsPredicate>,
}

impl std::fmt::Debug for ObsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObsFilter")
            .field("internal_ids", &self.internal_ids)
            .field("datastreams", &self.datastreams)
            .field("fois", &self.fois)
            .field("phenomenon_time", &self.phenomenon_time)
            .field("result_time", &self.result_time)
            .field("limit", &self.limit)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ObsFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to explicit composite keys.
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = ObsKey>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to observations produced by datastreams matching `filter`.
    pub fn with_datastreams(mut self, filter: DataStreamFilter) -> Self {
        self.datastreams = Some(filter);
        self
    }

    /// Restrict to observations of features matching `filter`.
    pub fn with_fois(mut self, filter: FoiFilter) -> Self {
        self.fois = Some(filter);
        self
    }

    /// Restrict by phenomenon time.
    pub fn with_phenomenon_time(mut self, begin: Time, end: Time) -> Self {
        self.phenomenon_time = Some(TemporalFilter::between(begin, end));
        self
    }

    /// Restrict by result time.
    pub fn with_result_time(mut self, begin: Time, end: Time) -> Self {
        self.result_time = Some(TemporalFilter::between(begin, end));
        self
    }

    /// Only the most recent result-time bucket per series.
    pub fn latest_result_only(mut self) -> Self {
        self.result_time = Some(TemporalFilter::Latest);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Attach an opaque predicate over resolved observations.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Observation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Reject malformed combinations before any work happens.
    pub fn validate(&self) -> HubResult<()> {
        match self.phenomenon_time {
            Some(TemporalFilter::Latest) => {
                return Err(HubError::validation(
                    "Latest is a result-time mode; phenomenon time takes absolute ranges",
                ));
            }
            Some(TemporalFilter::Current) => {
                return Err(HubError::validation(
                    "Current applies to metadata valid time, not phenomenon time",
                ));
            }
            _ => {}
        }
        if matches!(self.result_time, Some(TemporalFilter::Current)) {
            return Err(HubError::validation(
                "Current applies to metadata valid time, not result time",
            ));
        }
        if let Some(ds) = &self.datastreams {
            ds.validate()?;
        }
        if let Some(fois) = &self.fois {
            fois.validate()?;
        }
        Ok(())
    }

    /// The phenomenon-time extent this filter scans, unbounded by default.
    pub fn phenomenon_extent(&self) -> TimeExtent {
        match self.phenomenon_time {
            Some(TemporalFilter::Range(extent)) => extent,
            _ => TimeExtent::all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let filter = ObsFilter::all()
            .with_datastreams(
                DataStreamFilter::all()
                    .with_systems(SystemFilter::all().with_keywords(["weather"])),
            )
            .with_limit(10);
        assert!(filter.validate().is_ok());
        assert_eq!(filter.limit, Some(10));
        assert!(filter.datastreams.unwrap().systems.is_some());
    }

    #[test]
    fn test_latest_rejected_on_phenomenon_time() {
        let mut filter = ObsFilter::all();
        filter.phenomenon_time = Some(TemporalFilter::Latest);
        assert!(matches!(
            filter.validate(),
            Err(HubError::Validation { .. })
        ));
    }

    #[test]
    fn test_latest_rejected_on_metadata_valid_time() {
        let filter = SystemFilter::all().with_valid_time(TemporalFilter::Latest);
        assert!(matches!(
            filter.validate(),
            Err(HubError::Validation { .. })
        ));
    }

    #[test]
    fn test_nested_validation_propagates() {
        let bad = SystemFilter::all().with_valid_time(TemporalFilter::Latest);
        let filter = ObsFilter::all().with_datastreams(DataStreamFilter::all().with_systems(bad));
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_top_level_sentinel() {
        let filter = SystemFilter::all().with_parents([SystemId::NO_PARENT, SystemId(4)]);
        assert!(filter.wants_top_level());
        let filter = SystemFilter::all().with_parents([SystemId(4)]);
        assert!(!filter.wants_top_level());
    }

    #[test]
    fn test_temporal_to_extent() {
        let now = Time::from_seconds(100);
        let tf = TemporalFilter::between(Time::from_seconds(1), Time::from_seconds(2));
        assert!(tf.to_extent(now).is_some());
        assert_eq!(
            TemporalFilter::Current.to_extent(now),
            Some(TimeExtent::instant(now))
        );
        assert_eq!(TemporalFilter::Latest.to_extent(now), None);
    }
}
