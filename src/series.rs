/// The series index: grouping observations into series.
///
/// One series is one `(datastream, foi, result-time bucket)` combination.
/// The index maintains two orderings of the same grouping keys — by
/// datastream and by foi — both mapping to the series id, plus the reverse
/// id-to-key record. Series ids are assigned from a monotonic counter on
/// first insert and never reused; deletion only happens through the owning
/// datastream's cascade.
use crate::codec::VersionedCodec;
use crate::error::{HubError, HubResult};
use crate::keys::{self, ks};
use crate::kv::{BatchScan, OrderedStore, SharedStore, prefix_end};
use crate::time::Time;
use crate::types::{DataStreamId, FoiId, SeriesId, SeriesInfo, SeriesKey};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to the series index of one physical store.
///
/// Cheap to clone; all clones share the same ordered map and id counter.
#[derive(Debug, Clone)]
pub struct SeriesIndex {
    store: SharedStore,
    next_id: Arc<AtomicU64>,
    codec: VersionedCodec,
    batch_size: usize,
}

impl SeriesIndex {
    /// Create a handle over `store`.
    pub fn new(store: SharedStore, batch_size: usize) -> Self {
        Self {
            store,
            next_id: Arc::new(AtomicU64::new(1)),
            codec: VersionedCodec,
            batch_size,
        }
    }

    /// Resolve the series for `key`, creating it with the next id when it
    /// doesn't exist yet. Must run inside the caller's write-locked compound
    /// mutation so concurrent callers can't race on creation.
    pub(crate) fn get_or_create_locked(
        &self,
        store: &mut OrderedStore,
        key: SeriesKey,
    ) -> HubResult<SeriesId> {
        let by_ds = keys::series_by_ds_key(key.datastream, key.foi, key.result_time_bucket);
        if let Some(value) = store.get(&by_ds) {
            return decode_series_id(value);
        }

        let id = SeriesId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let by_foi = keys::series_by_foi_key(key.foi, key.datastream, key.result_time_bucket);
        let info = self.codec.encode(&SeriesInfo { key })?;
        store.insert(by_ds, id.0.to_be_bytes().to_vec());
        store.insert(by_foi, id.0.to_be_bytes().to_vec());
        store.insert(keys::series_info_key(id), info);
        tracing::debug!(series = id.0, datastream = key.datastream.0, "created series");
        Ok(id)
    }

    /// Look up the grouping key of a series.
    pub fn info(&self, id: SeriesId) -> HubResult<Option<SeriesInfo>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        match guard.get(&keys::series_info_key(id)) {
            Some(bytes) => Ok(Some(self.codec.decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// All series of one datastream, ordered (foi, bucket). Lazy.
    pub fn series_for_datastream(
        &self,
        ds: DataStreamId,
    ) -> impl Iterator<Item = (SeriesId, SeriesKey)> + Send + use<> {
        let mut prefix = vec![ks::SERIES_BY_DS];
        prefix.extend_from_slice(&ds.0.to_be_bytes());
        BatchScan::prefix(self.store.clone(), prefix, self.batch_size)
            .filter_map(|(k, v)| parse_by_ds_entry(&k, &v))
    }

    /// All series observing one foi, ordered (datastream, bucket). Lazy.
    pub fn series_for_foi(
        &self,
        foi: FoiId,
    ) -> impl Iterator<Item = (SeriesId, SeriesKey)> + Send + use<> {
        let mut prefix = vec![ks::SERIES_BY_FOI];
        prefix.extend_from_slice(&foi.0.to_be_bytes());
        BatchScan::prefix(self.store.clone(), prefix, self.batch_size)
            .filter_map(|(k, v)| parse_by_foi_entry(&k, &v))
    }

    /// Every series in the store. Lazy.
    pub fn all_series(&self) -> impl Iterator<Item = (SeriesId, SeriesKey)> + Send + use<> {
        let codec = self.codec;
        BatchScan::prefix(self.store.clone(), vec![ks::SERIES_INFO], self.batch_size).filter_map(
            move |(k, v)| {
                let id = SeriesId(u64::from_be_bytes(k.get(1..9)?.try_into().ok()?));
                let info: SeriesInfo = codec.decode(&v).ok()?;
                Some((id, info.key))
            },
        )
    }

    /// For each foi under `ds`, only the series holding the most recent
    /// result-time bucket. Uses floor probes per group instead of scanning
    /// every bucket.
    pub fn latest_series_for_datastream(&self, ds: DataStreamId) -> Vec<(SeriesId, SeriesKey)> {
        let mut prefix = vec![ks::SERIES_BY_DS];
        prefix.extend_from_slice(&ds.0.to_be_bytes());
        self.latest_per_group(&prefix, |k, v| parse_by_ds_entry(k, v), |key| {
            keys::series_by_ds_key(key.datastream, key.foi, Time::MAX)
        })
    }

    /// For each datastream observing `foi`, only the most recent bucket.
    pub fn latest_series_for_foi(&self, foi: FoiId) -> Vec<(SeriesId, SeriesKey)> {
        let mut prefix = vec![ks::SERIES_BY_FOI];
        prefix.extend_from_slice(&foi.0.to_be_bytes());
        self.latest_per_group(&prefix, |k, v| parse_by_foi_entry(k, v), |key| {
            keys::series_by_foi_key(key.foi, key.datastream, Time::MAX)
        })
    }

    /// Skip-scan: per group, probe the floor of the group's maximal key to
    /// find its latest bucket, then jump past the group.
    fn latest_per_group(
        &self,
        prefix: &[u8],
        parse: impl Fn(&[u8], &[u8]) -> Option<(SeriesId, SeriesKey)>,
        group_upper: impl Fn(&SeriesKey) -> Vec<u8>,
    ) -> Vec<(SeriesId, SeriesKey)> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        let mut cursor = prefix.to_vec();
        loop {
            let Some((k, v)) = guard.ceiling(&cursor) else {
                break;
            };
            if !k.starts_with(prefix) {
                break;
            }
            let Some((_, key)) = parse(k, v) else {
                break;
            };
            let upper = group_upper(&key);
            // The floor of the group's maximal key is its latest bucket.
            if let Some((lk, lv)) = guard.floor(&upper) {
                if let Some(entry) = parse(lk, lv) {
                    out.push(entry);
                }
            }
            cursor = upper;
            cursor.push(0); // strictly past the group
        }
        out
    }

    /// Remove the three index entries of a series. Runs inside the owning
    /// datastream's cascade, under its write lock.
    pub(crate) fn remove_series_locked(
        &self,
        store: &mut OrderedStore,
        id: SeriesId,
        key: SeriesKey,
    ) {
        store.remove(&keys::series_by_ds_key(
            key.datastream,
            key.foi,
            key.result_time_bucket,
        ));
        store.remove(&keys::series_by_foi_key(
            key.foi,
            key.datastream,
            key.result_time_bucket,
        ));
        store.remove(&keys::series_info_key(id));
    }

    /// Number of series currently known.
    pub fn series_count(&self) -> usize {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let prefix = [ks::SERIES_INFO];
        let end = prefix_end(&prefix);
        guard
            .scan(std::ops::Bound::Included(&prefix[..]), end.as_deref(), usize::MAX)
            .len()
    }
}

fn decode_series_id(bytes: &[u8]) -> HubResult<SeriesId> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| HubError::Decode("series id entry".into()))?;
    Ok(SeriesId(u64::from_be_bytes(arr)))
}

/// Parse one `(datastream, foi, bucket) -> id` entry.
pub(crate) fn parse_by_ds_entry(key: &[u8], value: &[u8]) -> Option<(SeriesId, SeriesKey)> {
    if key.len() != 1 + 8 + 8 + keys::TIME_LEN || key[0] != ks::SERIES_BY_DS {
        return None;
    }
    let ds = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let foi = u64::from_be_bytes(key[9..17].try_into().ok()?);
    let bucket = keys::decode_time(&key[17..])?;
    let id = decode_series_id(value).ok()?;
    Some((
        id,
        SeriesKey {
            datastream: DataStreamId(ds),
            foi: FoiId(foi),
            result_time_bucket: bucket,
        },
    ))
}

/// Parse one `(foi, datastream, bucket) -> id` entry.
fn parse_by_foi_entry(key: &[u8], value: &[u8]) -> Option<(SeriesId, SeriesKey)> {
    if key.len() != 1 + 8 + 8 + keys::TIME_LEN || key[0] != ks::SERIES_BY_FOI {
        return None;
    }
    let foi = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let ds = u64::from_be_bytes(key[9..17].try_into().ok()?);
    let bucket = keys::decode_time(&key[17..])?;
    let id = decode_series_id(value).ok()?;
    Some((
        id,
        SeriesKey {
            datastream: DataStreamId(ds),
            foi: FoiId(foi),
            result_time_bucket: bucket,
        },
    ))
}
