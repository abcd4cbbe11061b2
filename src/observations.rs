/// The observation store: time-indexed observations grouped into series.
///
/// Observations are keyed `(series id, phenomenon time)`; the packed form of
/// that pair is the public composite key callers see. Selection follows a
/// fixed resolution order: explicit keys bypass all indexing, a
/// datastream-driven query streams series-by-datastream ranges, a
/// foi-driven query streams series-by-foi ranges, and a join of both
/// resolves the datastream candidate set first (bounded by the fan-out cap)
/// and post-filters a foi-driven stream against it.
///
/// Nested datastream/foi filters are resolved to id sets by
/// [`LocalDatabase`](crate::database::LocalDatabase) before they reach this
/// store; this module only consumes resolved sets.
use crate::codec::VersionedCodec;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::filter::{ObsFilter, TemporalFilter};
use crate::keys::{self, ObsKey, ks};
use crate::kv::{BatchScan, OrderedStore, SharedStore, with_rollback};
use crate::merge::SortedMerge;
use crate::series::SeriesIndex;
use crate::time::{Time, TimeExtent};
use crate::types::{DataStreamId, FoiId, Observation, SeriesId, SeriesInfo, SeriesKey};
use std::collections::BTreeSet;
use std::ops::Bound;

/// A lazy, globally time-ordered observation stream.
pub type ObsStream = Box<dyn Iterator<Item = (ObsKey, Observation)> + Send>;

/// Resolved nested dimensions of an observation query: the datastream and
/// foi id sets the nested filters matched, `None` meaning "dimension not
/// present in the filter".
#[derive(Debug, Clone, Default)]
pub struct ResolvedObsQuery {
    /// Datastreams the nested datastream filter matched.
    pub datastreams: Option<BTreeSet<DataStreamId>>,
    /// Fois the nested foi filter matched.
    pub fois: Option<BTreeSet<FoiId>>,
}

/// Handle to the observation store of one physical store.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    store: SharedStore,
    series: SeriesIndex,
    codec: VersionedCodec,
    config: HubConfig,
}

impl ObservationStore {
    /// Create a handle sharing `store` with `series`.
    pub fn new(store: SharedStore, series: SeriesIndex, config: HubConfig) -> Self {
        Self {
            store,
            series,
            codec: VersionedCodec,
            config,
        }
    }

    /// The series index this store groups into.
    pub fn series_index(&self) -> &SeriesIndex {
        &self.series
    }

    /// Append an observation, resolving or creating its series, and return
    /// the packed public key. Series creation and the observation insert are
    /// one compound mutation: concurrent callers cannot race on series
    /// creation, and a failure rolls the store back to its prior state.
    pub fn add(&self, obs: Observation) -> HubResult<ObsKey> {
        let series_key = SeriesKey {
            datastream: obs.datastream,
            foi: obs.foi_or_none(),
            result_time_bucket: obs.result_time_bucket(),
        };
        with_rollback(&self.store, |store| {
            let series = self.series.get_or_create_locked(store, series_key)?;
            let key = ObsKey::new(series, obs.phenomenon_time);
            let bytes = self.codec.encode(&obs)?;
            store.insert(keys::obs_storage_key(&key), bytes);
            tracing::trace!(series = series.0, time = %obs.phenomenon_time, "added observation");
            Ok(key)
        })
    }

    /// Replace the observation stored under an existing key. The replacement
    /// must still belong to the key's series: its datastream, foi and
    /// result-time bucket have to match the grouping the key encodes, or the
    /// secondary indexes would disagree with the stored record.
    pub fn put(&self, key: &ObsKey, obs: Observation) -> HubResult<()> {
        with_rollback(&self.store, |store| {
            let storage_key = keys::obs_storage_key(key);
            if !store.contains(&storage_key) {
                return Err(HubError::integrity(format!(
                    "no observation stored under key {key}"
                )));
            }
            let info_bytes = store
                .get(&keys::series_info_key(key.series))
                .ok_or_else(|| HubError::integrity(format!("no series record for key {key}")))?;
            let info: SeriesInfo = self.codec.decode(info_bytes)?;
            if obs.datastream != info.key.datastream
                || obs.foi_or_none() != info.key.foi
                || obs.result_time_bucket() != info.key.result_time_bucket
            {
                return Err(HubError::validation(format!(
                    "replacement does not belong to the series of key {key}"
                )));
            }
            let bytes = self.codec.encode(&obs)?;
            store.insert(storage_key, bytes);
            Ok(())
        })
    }

    /// Look up one observation by its packed key.
    pub fn get(&self, key: &ObsKey) -> HubResult<Option<Observation>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        match guard.get(&keys::obs_storage_key(key)) {
            Some(bytes) => Ok(Some(self.codec.decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Select observations, yielding a lazy stream ordered by phenomenon
    /// time across every series the query touches.
    pub fn select(&self, filter: &ObsFilter, resolved: &ResolvedObsQuery) -> HubResult<ObsStream> {
        filter.validate()?;

        if let Some(ids) = &filter.internal_ids {
            return self.select_explicit(ids, filter, resolved);
        }

        let series = self.plan_series(filter, resolved)?;
        let extent = filter.phenomenon_extent();
        let streams: Vec<ObsStream> = series
            .into_iter()
            .map(|(id, _)| self.stream_series(id, extent, filter))
            .collect();
        let merged = SortedMerge::new(streams, |(key, _): &(ObsKey, Observation)| {
            key.phenomenon_time
        });
        Ok(match filter.limit {
            Some(limit) => Box::new(merged.take(limit)),
            None => Box::new(merged),
        })
    }

    /// Explicit keys bypass all indexing; other dimensions post-filter.
    fn select_explicit(
        &self,
        ids: &[ObsKey],
        filter: &ObsFilter,
        resolved: &ResolvedObsQuery,
    ) -> HubResult<ObsStream> {
        let mut hits: Vec<(ObsKey, Observation)> = Vec::with_capacity(ids.len());
        for key in ids {
            if let Some(obs) = self.get(key)? {
                hits.push((*key, obs));
            }
        }
        hits.sort_by_key(|(key, _)| (key.phenomenon_time, key.series));

        let accept = Self::post_filter(filter, resolved);
        let limited = hits
            .into_iter()
            .filter(move |(_, obs)| accept(obs))
            .take(filter.limit.unwrap_or(usize::MAX));
        Ok(Box::new(limited))
    }

    /// Decide which series the query touches, honoring the resolution order
    /// and the fan-out cap.
    fn plan_series(
        &self,
        filter: &ObsFilter,
        resolved: &ResolvedObsQuery,
    ) -> HubResult<Vec<(SeriesId, SeriesKey)>> {
        let latest_only = matches!(filter.result_time, Some(TemporalFilter::Latest));
        let cap = self.config.max_join_fanout;

        let series: Vec<(SeriesId, SeriesKey)> = match (&resolved.datastreams, &resolved.fois) {
            (Some(ds_ids), None) => {
                self.check_fanout(ds_ids.len())?;
                let mut out = Vec::new();
                for &ds in ds_ids {
                    if latest_only {
                        out.extend(self.series.latest_series_for_datastream(ds));
                    } else {
                        out.extend(self.series.series_for_datastream(ds));
                    }
                }
                out
            }
            (None, Some(foi_ids)) => {
                self.check_fanout(foi_ids.len())?;
                let mut out = Vec::new();
                for &foi in foi_ids {
                    if latest_only {
                        out.extend(self.series.latest_series_for_foi(foi));
                    } else {
                        out.extend(self.series.series_for_foi(foi));
                    }
                }
                out
            }
            (Some(ds_ids), Some(foi_ids)) => {
                // Join: the datastream candidate set must stay bounded, then
                // the foi side drives and post-filters against it.
                if ds_ids.len() > cap {
                    return Err(HubError::FanOutExceeded {
                        candidates: ds_ids.len(),
                        cap,
                    });
                }
                self.check_fanout(foi_ids.len())?;
                let mut out = Vec::new();
                for &foi in foi_ids {
                    let group: Vec<_> = if latest_only {
                        self.series.latest_series_for_foi(foi)
                    } else {
                        self.series.series_for_foi(foi).collect()
                    };
                    out.extend(
                        group
                            .into_iter()
                            .filter(|(_, key)| ds_ids.contains(&key.datastream)),
                    );
                }
                out
            }
            (None, None) => {
                if latest_only {
                    latest_per_group(self.series.all_series())
                } else {
                    self.series.all_series().collect()
                }
            }
        };

        // Result-time range prunes series with a literal bucket outside it;
        // sentinel buckets can only be judged per observation.
        let series = match filter.result_time {
            Some(TemporalFilter::Range(extent)) => series
                .into_iter()
                .filter(|(_, key)| {
                    key.result_time_bucket == Time::MAX || extent.contains(key.result_time_bucket)
                })
                .collect(),
            _ => series,
        };

        // The cap bounds dimension-driven queries; an unconstrained full
        // scan streams lazily and is never rejected for its size.
        if resolved.datastreams.is_some() || resolved.fois.is_some() {
            self.check_fanout(series.len())?;
        }
        Ok(series)
    }

    fn check_fanout(&self, candidates: usize) -> HubResult<()> {
        let cap = self.config.max_join_fanout;
        if candidates > cap {
            Err(HubError::FanOutExceeded { candidates, cap })
        } else {
            Ok(())
        }
    }

    /// One series' observations within `extent`, post-filtered. Ordered by
    /// phenomenon time by construction.
    fn stream_series(&self, id: SeriesId, extent: TimeExtent, filter: &ObsFilter) -> ObsStream {
        let start = keys::obs_storage_key(&ObsKey::new(id, extent.begin));
        let mut end = keys::obs_storage_key(&ObsKey::new(id, extent.end));
        end.push(0); // inclusive upper bound
        let codec = self.codec;
        let scan = BatchScan::new(
            self.store.clone(),
            start,
            Some(end),
            self.config.scan_batch_size,
        );
        let decoded = scan.filter_map(move |(raw_key, bytes)| {
            let key = ObsKey::decode(raw_key.get(1..)?)?;
            match codec.decode::<Observation>(&bytes) {
                Ok(obs) => Some((key, obs)),
                Err(err) => {
                    // Corrupt entries are skipped, never silently reordered.
                    tracing::warn!(%key, %err, "undecodable observation record");
                    None
                }
            }
        });

        let result_extent = match filter.result_time {
            Some(TemporalFilter::Range(extent)) => Some(extent),
            _ => None,
        };
        let predicate = filter.predicate.clone();
        Box::new(decoded.filter(move |(_, obs)| {
            if let Some(extent) = &result_extent {
                if !extent.contains(obs.result_time) {
                    return false;
                }
            }
            predicate.as_ref().is_none_or(|p| p(obs))
        }))
    }

    /// Post-filter for explicit-key selection: every non-id dimension
    /// applies to the decoded observation.
    fn post_filter(
        filter: &ObsFilter,
        resolved: &ResolvedObsQuery,
    ) -> impl Fn(&Observation) -> bool + Send + 'static + use<> {
        let phen = match filter.phenomenon_time {
            Some(TemporalFilter::Range(extent)) => Some(extent),
            _ => None,
        };
        let result = match filter.result_time {
            Some(TemporalFilter::Range(extent)) => Some(extent),
            _ => None,
        };
        let ds_ids = resolved.datastreams.clone();
        let foi_ids = resolved.fois.clone();
        let predicate = filter.predicate.clone();
        move |obs: &Observation| {
            phen.is_none_or(|e| e.contains(obs.phenomenon_time))
                && result.is_none_or(|e| e.contains(obs.result_time))
                && ds_ids.as_ref().is_none_or(|ids| ids.contains(&obs.datastream))
                && foi_ids
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&obs.foi_or_none()))
                && predicate.as_ref().is_none_or(|p| p(obs))
        }
    }

    /// Remove every observation the filter matches, returning the count.
    pub fn remove(&self, filter: &ObsFilter, resolved: &ResolvedObsQuery) -> HubResult<usize> {
        let doomed: Vec<ObsKey> = self.select(filter, resolved)?.map(|(key, _)| key).collect();
        with_rollback(&self.store, |store| {
            for key in &doomed {
                store.remove(&keys::obs_storage_key(key));
            }
            Ok(doomed.len())
        })
    }

    /// Remove a datastream's series and all their observations. Runs inside
    /// the caller's compound mutation (the datastream record itself is
    /// removed after this returns, so orphaned observations are never
    /// visible mid-operation).
    pub(crate) fn remove_datastream_locked(
        &self,
        store: &mut OrderedStore,
        ds: DataStreamId,
    ) -> HubResult<usize> {
        let mut prefix = vec![ks::SERIES_BY_DS];
        prefix.extend_from_slice(&ds.0.to_be_bytes());
        let entries = store.scan(
            Bound::Included(prefix.as_slice()),
            crate::kv::prefix_end(&prefix).as_deref(),
            usize::MAX,
        );

        let mut removed = 0;
        for (raw_key, raw_value) in entries {
            let Some((id, series_key)) = crate::series::parse_by_ds_entry(&raw_key, &raw_value)
            else {
                return Err(HubError::Decode("series index entry".into()));
            };
            let mut obs_prefix = vec![ks::OBS];
            keys::push_varint(&mut obs_prefix, id.0);
            let end = crate::kv::prefix_end(&obs_prefix);
            removed += store.remove_range(&obs_prefix, end.as_deref());
            self.series.remove_series_locked(store, id, series_key);
        }
        tracing::debug!(datastream = ds.0, observations = removed, "cascaded datastream removal");
        Ok(removed)
    }

    /// The phenomenon-time and result-time ranges currently covered by a
    /// datastream's observations, or `None` when it has none. Uses first/
    /// last key probes per series instead of scanning observations.
    pub fn datastream_time_ranges(
        &self,
        ds: DataStreamId,
    ) -> HubResult<Option<(TimeExtent, TimeExtent)>> {
        let series: Vec<(SeriesId, SeriesKey)> = self.series.series_for_datastream(ds).collect();
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut phen: Option<TimeExtent> = None;
        let mut result: Option<TimeExtent> = None;
        for (id, key) in series {
            let mut prefix = vec![ks::OBS];
            keys::push_varint(&mut prefix, id.0);
            let Some((first, _)) = guard.ceiling(&prefix) else {
                continue;
            };
            if !first.starts_with(&prefix) {
                continue;
            }
            let Some(first_key) = ObsKey::decode(&first[1..]) else {
                continue;
            };
            let upper = crate::kv::prefix_end(&prefix);
            let last_key = match upper.as_deref().and_then(|u| guard.floor(u)) {
                Some((last, _)) if last.starts_with(&prefix) => {
                    ObsKey::decode(&last[1..]).unwrap_or(first_key)
                }
                _ => first_key,
            };

            let span = TimeExtent::new(first_key.phenomenon_time, last_key.phenomenon_time);
            expand_extent(&mut phen, span);
            let result_span = if key.result_time_bucket == Time::MAX {
                span
            } else {
                TimeExtent::instant(key.result_time_bucket)
            };
            expand_extent(&mut result, result_span);
        }
        Ok(phen.zip(result))
    }

    /// Total number of stored observations matching a filter.
    pub fn count(&self, filter: &ObsFilter, resolved: &ResolvedObsQuery) -> HubResult<usize> {
        Ok(self.select(filter, resolved)?.count())
    }
}

fn expand_extent(slot: &mut Option<TimeExtent>, span: TimeExtent) {
    match slot {
        Some(extent) => {
            extent.expand(span.begin);
            extent.expand(span.end);
        }
        None => *slot = Some(span),
    }
}

/// Keep only the latest result-time bucket per `(datastream, foi)` group.
fn latest_per_group(
    series: impl Iterator<Item = (SeriesId, SeriesKey)>,
) -> Vec<(SeriesId, SeriesKey)> {
    use std::collections::BTreeMap;
    let mut best: BTreeMap<(DataStreamId, FoiId), (SeriesId, SeriesKey)> = BTreeMap::new();
    for (id, key) in series {
        let slot = best.entry((key.datastream, key.foi)).or_insert((id, key));
        if key.result_time_bucket > slot.1.result_time_bucket {
            *slot = (id, key);
        }
    }
    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::shared_store;
    use serde_json::json;

    fn store() -> ObservationStore {
        let shared = shared_store();
        let series = SeriesIndex::new(shared.clone(), 16);
        ObservationStore::new(shared, series, HubConfig::default())
    }

    fn obs(ds: u64, secs: i64) -> Observation {
        Observation::new(DataStreamId(ds), Time::from_seconds(secs), json!(secs))
    }

    fn resolved_ds(ids: &[u64]) -> ResolvedObsQuery {
        ResolvedObsQuery {
            datastreams: Some(ids.iter().map(|&i| DataStreamId(i)).collect()),
            fois: None,
        }
    }

    #[test]
    fn test_add_then_get_round_trip() {
        let store = store();
        let key = store.add(obs(1, 100)).unwrap();
        let back = store.get(&key).unwrap().unwrap();
        assert_eq!(back.phenomenon_time, Time::from_seconds(100));
        assert_eq!(back.result, json!(100));
    }

    #[test]
    fn test_same_combination_routes_to_same_series() {
        let store = store();
        let k1 = store.add(obs(1, 100)).unwrap();
        let k2 = store.add(obs(1, 101)).unwrap();
        let k3 = store.add(obs(2, 100)).unwrap();
        assert_eq!(k1.series, k2.series);
        assert_ne!(k1.series, k3.series);
    }

    #[test]
    fn test_select_orders_across_series() {
        let store = store();
        for secs in [5, 1, 9] {
            store.add(obs(1, secs)).unwrap();
        }
        for secs in [4, 2, 8] {
            store.add(obs(2, secs)).unwrap();
        }
        let times: Vec<i64> = store
            .select(&ObsFilter::all(), &ResolvedObsQuery::default())
            .unwrap()
            .map(|(k, _)| k.phenomenon_time.seconds)
            .collect();
        assert_eq!(times, vec![1, 2, 4, 5, 8, 9]);
    }

    #[test]
    fn test_select_by_datastream_and_time_range() {
        let store = store();
        for secs in 0..10 {
            store.add(obs(1, secs)).unwrap();
            store.add(obs(2, secs)).unwrap();
        }
        let filter =
            ObsFilter::all().with_phenomenon_time(Time::from_seconds(3), Time::from_seconds(6));
        let hits: Vec<_> = store.select(&filter, &resolved_ds(&[1])).unwrap().collect();
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|(_, o)| o.datastream == DataStreamId(1)));
    }

    #[test]
    fn test_select_explicit_ids_bypass_indexes() {
        let store = store();
        let k1 = store.add(obs(1, 1)).unwrap();
        let _ = store.add(obs(1, 2)).unwrap();
        let k3 = store.add(obs(1, 3)).unwrap();

        let filter = ObsFilter::all().with_internal_ids([k3, k1]);
        let got: Vec<ObsKey> = store
            .select(&filter, &ResolvedObsQuery::default())
            .unwrap()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(got, vec![k1, k3]);

        // Missing ids are skipped, not errors.
        let filter = ObsFilter::all().with_internal_ids([ObsKey::new(SeriesId(99), Time::MIN)]);
        assert_eq!(store.select(&filter, &ResolvedObsQuery::default()).unwrap().count(), 0);
    }

    #[test]
    fn test_latest_result_time_only() {
        let store = store();
        // Two result-time buckets for the same (ds, foi) combination.
        let early = Observation::new(DataStreamId(1), Time::from_seconds(1), json!("old"))
            .with_result_time(Time::from_seconds(10));
        let late = Observation::new(DataStreamId(1), Time::from_seconds(1), json!("new"))
            .with_result_time(Time::from_seconds(20));
        store.add(early).unwrap();
        store.add(late).unwrap();

        let filter = ObsFilter::all().latest_result_only();
        let hits: Vec<_> = store
            .select(&filter, &resolved_ds(&[1]))
            .unwrap()
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.result, json!("new"));
    }

    #[test]
    fn test_fanout_cap_fails_fast() {
        let shared = shared_store();
        let series = SeriesIndex::new(shared.clone(), 16);
        let store = ObservationStore::new(
            shared,
            series,
            HubConfig::default().with_max_join_fanout(2),
        );
        for ds in 1..=3 {
            store.add(obs(ds, 1)).unwrap();
        }
        let result = store.select(&ObsFilter::all(), &resolved_ds(&[1, 2, 3]));
        assert!(matches!(result, Err(HubError::FanOutExceeded { .. })));
    }

    #[test]
    fn test_predicate_and_limit() {
        let store = store();
        for secs in 0..10 {
            store.add(obs(1, secs)).unwrap();
        }
        let filter = ObsFilter::all()
            .with_predicate(|o| o.phenomenon_time.seconds % 2 == 0)
            .with_limit(3);
        let times: Vec<i64> = store
            .select(&filter, &ResolvedObsQuery::default())
            .unwrap()
            .map(|(k, _)| k.phenomenon_time.seconds)
            .collect();
        assert_eq!(times, vec![0, 2, 4]);
    }

    #[test]
    fn test_remove_by_filter() {
        let store = store();
        for secs in 0..6 {
            store.add(obs(1, secs)).unwrap();
        }
        let filter =
            ObsFilter::all().with_phenomenon_time(Time::from_seconds(0), Time::from_seconds(2));
        let removed = store.remove(&filter, &ResolvedObsQuery::default()).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            store.count(&ObsFilter::all(), &ResolvedObsQuery::default()).unwrap(),
            3
        );
    }

    #[test]
    fn test_cascade_removes_series_and_observations() {
        let store = store();
        for secs in 0..5 {
            store.add(obs(1, secs)).unwrap();
            store.add(obs(2, secs)).unwrap();
        }
        let removed = with_rollback(&store.store, |s| {
            store.remove_datastream_locked(s, DataStreamId(1))
        })
        .unwrap();
        assert_eq!(removed, 5);
        assert_eq!(store.series.series_for_datastream(DataStreamId(1)).count(), 0);
        assert_eq!(
            store.count(&ObsFilter::all(), &ResolvedObsQuery::default()).unwrap(),
            5
        );
    }

    #[test]
    fn test_time_ranges() {
        let store = store();
        assert!(store.datastream_time_ranges(DataStreamId(1)).unwrap().is_none());
        for secs in [3, 7, 5] {
            store.add(obs(1, secs)).unwrap();
        }
        let (phen, result) = store.datastream_time_ranges(DataStreamId(1)).unwrap().unwrap();
        assert_eq!(phen, TimeExtent::new(Time::from_seconds(3), Time::from_seconds(7)));
        assert_eq!(result, phen); // sentinel bucket tracks phenomenon time
    }

    #[test]
    fn test_put_replaces_existing_only() {
        let store = store();
        let key = store.add(obs(1, 1)).unwrap();
        store
            .put(&key, Observation::new(DataStreamId(1), Time::from_seconds(1), json!("fixed")))
            .unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().result, json!("fixed"));
        // Unknown key is an integrity error.
        let missing = ObsKey::new(SeriesId(42), Time::from_seconds(9));
        assert!(matches!(
            store.put(&missing, obs(1, 9)),
            Err(HubError::Integrity { .. })
        ));
    }

    #[test]
    fn test_put_rejects_series_mismatch() {
        let store = store();
        let key = store.add(obs(1, 1)).unwrap();

        // A different datastream, foi or result-time bucket would desync the
        // series indexes from the stored record.
        assert!(matches!(
            store.put(&key, obs(2, 1)),
            Err(HubError::Validation { .. })
        ));
        assert!(matches!(
            store.put(&key, obs(1, 1).with_foi(FoiId(2))),
            Err(HubError::Validation { .. })
        ));
        assert!(matches!(
            store.put(&key, obs(1, 1).with_result_time(Time::from_seconds(50))),
            Err(HubError::Validation { .. })
        ));
        // The stored record is untouched after the rejections.
        assert_eq!(store.get(&key).unwrap().unwrap().result, json!(1));
    }

    #[test]
    fn test_full_scan_is_not_capped() {
        let shared = shared_store();
        let series = SeriesIndex::new(shared.clone(), 16);
        let store = ObservationStore::new(
            shared,
            series,
            HubConfig::default().with_max_join_fanout(2),
        );
        for ds in 1..=5 {
            store.add(obs(ds, ds as i64)).unwrap();
        }
        // An unconstrained scan streams every series even past the cap.
        let count = store
            .count(&ObsFilter::all(), &ResolvedObsQuery::default())
            .unwrap();
        assert_eq!(count, 5);
        // A dimension-driven query over the same series still fails fast.
        assert!(matches!(
            store.select(&ObsFilter::all(), &resolved_ds(&[1, 2, 3])),
            Err(HubError::FanOutExceeded { .. })
        ));
    }

    #[test]
    fn test_scan_skips_undecodable_records() {
        let store = store();
        let k1 = store.add(obs(1, 1)).unwrap();
        store.add(obs(1, 3)).unwrap();

        // Plant bytes no format version can decode in the middle of the
        // series range.
        let bad = ObsKey::new(k1.series, Time::from_seconds(2));
        store
            .store
            .write()
            .unwrap()
            .insert(keys::obs_storage_key(&bad), vec![0xFF, 0xFF, 0xFF]);

        let times: Vec<i64> = store
            .select(&ObsFilter::all(), &ResolvedObsQuery::default())
            .unwrap()
            .map(|(k, _)| k.phenomenon_time.seconds)
            .collect();
        assert_eq!(times, vec![1, 3]);

        // Point lookups surface the failure instead of hiding it.
        assert!(matches!(store.get(&bad), Err(HubError::Decode(_))));
    }
}
