/// One physical store: the resource stores sharing a single ordered map.
///
/// [`LocalDatabase`] wires the metadata stores, the series index and the
/// observation store over one [`SharedStore`], and is the layer where nested
/// cross-resource filters get resolved: a system filter may nest a
/// datastream filter and vice versa, so resolution lives above both stores
/// and hands each one a pre-resolved id set. Resolution recurses; the
/// nesting depth is bounded by the filter value itself.
///
/// All compound mutations (an observation insert creating its series, a
/// datastream removal cascading to its observations) run under one
/// checkpointed write section, so a crash of any step leaves the whole
/// store untouched.
use crate::codec::{JsonSchemaCompat, SchemaCompat};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::filter::{
    CommandStreamFilter, DataStreamFilter, FoiFilter, ObsFilter, SystemFilter,
};
use crate::keys::ObsKey;
use crate::kv::{SharedStore, shared_store, with_rollback};
use crate::metadata::{CommandStreamStore, DataStreamStore, FoiStore, SystemStore};
use crate::observations::{ObsStream, ObservationStore, ResolvedObsQuery};
use crate::series::SeriesIndex;
use crate::time::TimeExtent;
use crate::types::{
    CommandStreamId, CommandStreamInfo, DataStreamId, DataStreamInfo, FoiId, FoiInfo, Observation,
    SystemId, SystemInfo,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One physical observation database.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    store: SharedStore,
    config: HubConfig,
    systems: SystemStore,
    datastreams: DataStreamStore,
    command_streams: CommandStreamStore,
    fois: FoiStore,
    observations: ObservationStore,
    compat: Arc<dyn SchemaCompat>,
}

impl LocalDatabase {
    /// Create an empty database with the default schema checker.
    pub fn new(config: HubConfig) -> Self {
        Self::with_compat(config, Arc::new(JsonSchemaCompat))
    }

    /// Create an empty database with a custom schema compatibility checker.
    pub fn with_compat(config: HubConfig, compat: Arc<dyn SchemaCompat>) -> Self {
        let store = shared_store();
        let series = SeriesIndex::new(store.clone(), config.scan_batch_size);
        let observations = ObservationStore::new(store.clone(), series, config.clone());
        Self {
            systems: SystemStore::new(store.clone()),
            datastreams: DataStreamStore::new(store.clone()),
            command_streams: CommandStreamStore::new(store.clone()),
            fois: FoiStore::new(store.clone()),
            observations,
            store,
            config,
            compat,
        }
    }

    /// The configuration this database was created with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The system store.
    pub fn systems(&self) -> &SystemStore {
        &self.systems
    }

    /// The datastream store.
    pub fn datastreams(&self) -> &DataStreamStore {
        &self.datastreams
    }

    /// The command stream store.
    pub fn command_streams(&self) -> &CommandStreamStore {
        &self.command_streams
    }

    /// The feature-of-interest store.
    pub fn fois(&self) -> &FoiStore {
        &self.fois
    }

    /// The observation store.
    pub fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    /// The schema compatibility checker used by stream revisioning.
    pub fn schema_compat(&self) -> &dyn SchemaCompat {
        self.compat.as_ref()
    }

    /// Select systems, resolving any nested datastream dimension first.
    pub fn select_systems(&self, filter: &SystemFilter) -> HubResult<Vec<(SystemId, SystemInfo)>> {
        filter.validate()?;
        let producers = match &filter.datastreams {
            Some(nested) => {
                let matches = self.select_datastreams(nested)?;
                Some(matches.into_iter().map(|(_, info)| info.system).collect())
            }
            None => None,
        };
        self.systems.select(filter, producers.as_ref())
    }

    /// Select datastreams, resolving any nested system dimension first.
    pub fn select_datastreams(
        &self,
        filter: &DataStreamFilter,
    ) -> HubResult<Vec<(DataStreamId, DataStreamInfo)>> {
        filter.validate()?;
        let producers = match &filter.systems {
            Some(nested) => Some(self.resolve_system_ids(nested)?),
            None => None,
        };
        self.datastreams.select(filter, producers.as_ref())
    }

    /// Select command streams, resolving any nested system dimension first.
    pub fn select_command_streams(
        &self,
        filter: &CommandStreamFilter,
    ) -> HubResult<Vec<(CommandStreamId, CommandStreamInfo)>> {
        filter.validate()?;
        let producers = match &filter.systems {
            Some(nested) => Some(self.resolve_system_ids(nested)?),
            None => None,
        };
        self.command_streams.select(filter, producers.as_ref())
    }

    /// Select features of interest, resolving any nested parent-system
    /// dimension first.
    pub fn select_fois(&self, filter: &FoiFilter) -> HubResult<Vec<(FoiId, FoiInfo)>> {
        filter.validate()?;
        let parents = match &filter.parent_systems {
            Some(nested) => {
                let mut ids = self.resolve_system_ids(nested)?;
                // Keep the unattached-features sentinel visible to the store.
                if nested.wants_top_level() {
                    ids.insert(SystemId::NO_PARENT);
                }
                Some(ids)
            }
            None => None,
        };
        self.fois.select(filter, parents.as_ref())
    }

    /// Select observations as a lazy stream ordered by phenomenon time.
    /// Nested datastream and foi filters resolve to id sets here; an empty
    /// resolved set short-circuits to an empty stream.
    pub fn select_observations(&self, filter: &ObsFilter) -> HubResult<ObsStream> {
        filter.validate()?;
        let resolved = self.resolve_obs_query(filter)?;
        self.observations.select(filter, &resolved)
    }

    /// Remove every observation a filter matches, returning the count.
    pub fn remove_observations(&self, filter: &ObsFilter) -> HubResult<usize> {
        filter.validate()?;
        let resolved = self.resolve_obs_query(filter)?;
        self.observations.remove(filter, &resolved)
    }

    /// Count observations matching a filter.
    pub fn count_observations(&self, filter: &ObsFilter) -> HubResult<usize> {
        filter.validate()?;
        let resolved = self.resolve_obs_query(filter)?;
        self.observations.count(filter, &resolved)
    }

    /// Append an observation.
    pub fn add_observation(&self, obs: Observation) -> HubResult<ObsKey> {
        self.observations.add(obs)
    }

    /// Whether a datastream has any recorded observations.
    pub fn datastream_has_observations(&self, ds: DataStreamId) -> HubResult<bool> {
        Ok(self.observations.datastream_time_ranges(ds)?.is_some())
    }

    /// The phenomenon-time and result-time ranges a datastream currently
    /// covers.
    pub fn datastream_time_ranges(
        &self,
        ds: DataStreamId,
    ) -> HubResult<Option<(TimeExtent, TimeExtent)>> {
        self.observations.datastream_time_ranges(ds)
    }

    /// Remove a datastream revision together with its series and
    /// observations, as one compound mutation.
    pub fn remove_datastream(&self, id: DataStreamId) -> HubResult<Option<DataStreamInfo>> {
        with_rollback(&self.store, |store| {
            self.observations.remove_datastream_locked(store, id)?;
            self.datastreams.remove_locked(store, id)
        })
    }

    fn resolve_obs_query(&self, filter: &ObsFilter) -> HubResult<ResolvedObsQuery> {
        let datastreams = match &filter.datastreams {
            Some(nested) => Some(
                self.select_datastreams(nested)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect(),
            ),
            None => None,
        };
        let fois = match &filter.fois {
            Some(nested) => {
                let mut ids: BTreeSet<FoiId> =
                    self.select_fois(nested)?.into_iter().map(|(id, _)| id).collect();
                // A foi filter selecting unattached features also matches
                // observations recorded without a feature.
                if nested
                    .parent_systems
                    .as_ref()
                    .is_some_and(|sys| sys.wants_top_level())
                {
                    ids.insert(FoiId::NONE);
                }
                Some(ids)
            }
            None => None,
        };
        Ok(ResolvedObsQuery { datastreams, fois })
    }

    fn resolve_system_ids(&self, filter: &SystemFilter) -> HubResult<BTreeSet<SystemId>> {
        Ok(self
            .select_systems(filter)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Time;
    use serde_json::json;

    fn db() -> LocalDatabase {
        LocalDatabase::new(HubConfig::default())
    }

    fn weather_station(db: &LocalDatabase) -> (SystemId, DataStreamId) {
        let sys = db
            .systems()
            .add(SystemInfo::new("urn:x:station1").with_name("Weather station"))
            .unwrap();
        let ds = db
            .datastreams()
            .add(
                DataStreamInfo::new(sys, "temp")
                    .with_name("Air temperature")
                    .with_schema(json!({"name": "temp"})),
            )
            .unwrap();
        (sys, ds)
    }

    #[test]
    fn test_nested_system_filter_resolves_to_datastreams() {
        let db = db();
        let (sys, ds) = weather_station(&db);
        let other = db.systems().add(SystemInfo::new("urn:x:buoy")).unwrap();
        db.datastreams()
            .add(DataStreamInfo::new(other, "temp").with_schema(json!({"name": "temp"})))
            .unwrap();

        let hits = db
            .select_datastreams(
                &DataStreamFilter::all()
                    .with_systems(SystemFilter::all().with_keywords(["weather"])),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, ds);
        assert_eq!(hits[0].1.system, sys);
    }

    #[test]
    fn test_nested_datastream_filter_resolves_to_systems() {
        let db = db();
        let (sys, _) = weather_station(&db);
        db.systems().add(SystemInfo::new("urn:x:idle")).unwrap();

        let hits = db
            .select_systems(
                &SystemFilter::all()
                    .with_datastreams(DataStreamFilter::all().with_output_name("temp")),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, sys);
    }

    #[test]
    fn test_nested_datastream_filter_with_limit_finds_late_candidate() {
        let db = db();
        // Two systems registered before the one that owns the matching
        // datastream; the limit must apply to accepted rows, not candidates.
        db.systems().add(SystemInfo::new("urn:x:idle1")).unwrap();
        db.systems().add(SystemInfo::new("urn:x:idle2")).unwrap();
        let (sys, _) = weather_station(&db);

        let hits = db
            .select_systems(
                &SystemFilter::all()
                    .with_datastreams(DataStreamFilter::all().with_output_name("temp"))
                    .with_limit(1),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, sys);
    }

    #[test]
    fn test_observation_query_resolves_nested_filters() {
        let db = db();
        let (_, ds) = weather_station(&db);
        for secs in 0..5 {
            db.add_observation(Observation::new(ds, Time::from_seconds(secs), json!(secs)))
                .unwrap();
        }
        // An unrelated datastream's observations must not leak in.
        let other = db.systems().add(SystemInfo::new("urn:x:buoy")).unwrap();
        let other_ds = db
            .datastreams()
            .add(DataStreamInfo::new(other, "salinity").with_schema(json!({"name": "salinity"})))
            .unwrap();
        db.add_observation(Observation::new(other_ds, Time::from_seconds(1), json!(35)))
            .unwrap();

        let filter = ObsFilter::all().with_datastreams(
            DataStreamFilter::all().with_systems(SystemFilter::all().with_keywords(["weather"])),
        );
        assert_eq!(db.count_observations(&filter).unwrap(), 5);
    }

    #[test]
    fn test_empty_nested_resolution_yields_empty_stream() {
        let db = db();
        let (_, ds) = weather_station(&db);
        db.add_observation(Observation::new(ds, Time::from_seconds(1), json!(1)))
            .unwrap();

        let filter = ObsFilter::all()
            .with_datastreams(DataStreamFilter::all().with_output_name("no-such-output"));
        assert_eq!(db.count_observations(&filter).unwrap(), 0);
    }

    #[test]
    fn test_remove_datastream_cascades() {
        let db = db();
        let (_, ds) = weather_station(&db);
        for secs in 0..3 {
            db.add_observation(Observation::new(ds, Time::from_seconds(secs), json!(secs)))
                .unwrap();
        }
        assert!(db.datastream_has_observations(ds).unwrap());

        let removed = db.remove_datastream(ds).unwrap();
        assert!(removed.is_some());
        assert!(db.datastreams().get(ds).unwrap().is_none());
        assert!(!db.datastream_has_observations(ds).unwrap());
        assert_eq!(db.count_observations(&ObsFilter::all()).unwrap(), 0);
    }

    #[test]
    fn test_foi_filter_with_unattached_sentinel() {
        let db = db();
        let root = db.systems().add(SystemInfo::new("urn:x:root")).unwrap();
        let station = db
            .systems()
            .add(SystemInfo::new("urn:x:station1").with_parent(root))
            .unwrap();
        let ds = db
            .datastreams()
            .add(DataStreamInfo::new(station, "temp").with_schema(json!({"name": "temp"})))
            .unwrap();
        let attached = db
            .fois()
            .add(FoiInfo::new("urn:x:roof").with_parent_system(station))
            .unwrap();
        db.fois().add(FoiInfo::new("urn:x:field")).unwrap();

        db.add_observation(
            Observation::new(ds, Time::from_seconds(1), json!(1)).with_foi(attached),
        )
        .unwrap();
        db.add_observation(Observation::new(ds, Time::from_seconds(2), json!(2)))
            .unwrap();

        // The no-parent sentinel in the nested system dimension matches
        // unattached features and, for observations, records without a
        // feature at all. Features of non-top-level systems stay excluded.
        let unattached = FoiFilter::all()
            .with_parent_systems(SystemFilter::all().with_parents([SystemId::NO_PARENT]));
        let hits = db.select_fois(&unattached).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.uid, "urn:x:field");

        let obs_hits = db
            .count_observations(&ObsFilter::all().with_fois(unattached))
            .unwrap();
        assert_eq!(obs_hits, 1);
    }
}
