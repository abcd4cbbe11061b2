/// Versioned metadata stores for systems, datastreams, command streams and
/// features of interest.
///
/// All four kinds share the same physical layout: a record keyspace keyed by
/// local id, a revision index keyed `(producer key, inverted valid-start)`
/// so the first entry of a bounded range probe is the latest revision, and a
/// full-text posting keyspace over names/descriptions/schema labels. The
/// generic [`VersionedStore`] owns that layout; the kind stores add typed
/// ids, the revisioning algorithm and kind-specific selection.
///
/// Nested cross-resource filters (a system filter inside a datastream
/// filter and vice versa) are resolved by
/// [`LocalDatabase`](crate::database::LocalDatabase); selects here take the
/// already-resolved id sets.
use crate::codec::{SchemaCompat, VersionedCodec};
use crate::error::{HubError, HubResult};
use crate::filter::{
    CommandStreamFilter, DataStreamFilter, FoiFilter, SystemFilter, TemporalFilter,
};
use crate::fulltext;
use crate::keys::{self, ks};
use crate::kv::{OrderedStore, SharedStore, prefix_end, with_rollback};
use crate::time::{Time, TimeExtent};
use crate::types::{
    CommandStreamId, CommandStreamInfo, DataStreamId, DataStreamInfo, FoiId, FoiInfo, SystemId,
    SystemInfo, UpdateOutcome,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A record kind storable in a [`VersionedStore`].
pub trait MetadataRecord:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Prefix grouping all revisions of one logical entity: producer id plus
    /// output name for streams, the uid for systems and features.
    fn producer_key(&self) -> Vec<u8>;

    /// When this revision becomes valid.
    fn valid_start(&self) -> Time;

    /// Store the computed valid-time end ("until superseded" = `None`).
    fn set_valid_end(&mut self, end: Option<Time>);

    /// Read back the computed valid-time end.
    fn valid_end(&self) -> Option<Time>;

    /// Text sources feeding the full-text index.
    fn text_sources(&self) -> Vec<String>;
}

fn producer_key_for(system: SystemId, name: &str) -> Vec<u8> {
    let mut key = system.0.to_be_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

fn uid_key(uid: &str) -> Vec<u8> {
    let mut key = uid.as_bytes().to_vec();
    key.push(0);
    key
}

/// Uids and stream names are NUL-terminated inside producer keys, so an
/// embedded NUL byte would make two distinct identifiers prefix-ambiguous.
fn check_identifier(kind: &str, value: &str) -> HubResult<()> {
    if value.contains('\0') {
        return Err(HubError::validation(format!(
            "{kind} '{}' contains a NUL byte",
            value.escape_default()
        )));
    }
    Ok(())
}

/// Collect label-ish strings from an opaque schema descriptor.
fn schema_text(schema: &JsonValue, out: &mut Vec<String>) {
    match schema {
        JsonValue::Object(map) => {
            for (field, value) in map {
                if let JsonValue::String(s) = value {
                    if matches!(field.as_str(), "label" | "definition" | "name" | "description") {
                        out.push(s.clone());
                    }
                } else {
                    schema_text(value, out);
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                schema_text(item, out);
            }
        }
        _ => {}
    }
}

impl MetadataRecord for DataStreamInfo {
    fn producer_key(&self) -> Vec<u8> {
        producer_key_for(self.system, &self.output_name)
    }
    fn valid_start(&self) -> Time {
        self.valid_start
    }
    fn set_valid_end(&mut self, end: Option<Time>) {
        self.valid_end = end;
    }
    fn valid_end(&self) -> Option<Time> {
        self.valid_end
    }
    fn text_sources(&self) -> Vec<String> {
        let mut out = vec![self.output_name.clone(), self.name.clone(), self.description.clone()];
        schema_text(&self.schema, &mut out);
        out
    }
}

impl MetadataRecord for CommandStreamInfo {
    fn producer_key(&self) -> Vec<u8> {
        producer_key_for(self.system, &self.control_name)
    }
    fn valid_start(&self) -> Time {
        self.valid_start
    }
    fn set_valid_end(&mut self, end: Option<Time>) {
        self.valid_end = end;
    }
    fn valid_end(&self) -> Option<Time> {
        self.valid_end
    }
    fn text_sources(&self) -> Vec<String> {
        let mut out = vec![self.control_name.clone(), self.name.clone(), self.description.clone()];
        schema_text(&self.schema, &mut out);
        out
    }
}

impl MetadataRecord for SystemInfo {
    fn producer_key(&self) -> Vec<u8> {
        uid_key(&self.uid)
    }
    fn valid_start(&self) -> Time {
        self.valid_start
    }
    fn set_valid_end(&mut self, end: Option<Time>) {
        self.valid_end = end;
    }
    fn valid_end(&self) -> Option<Time> {
        self.valid_end
    }
    fn text_sources(&self) -> Vec<String> {
        vec![self.uid.clone(), self.name.clone(), self.description.clone()]
    }
}

impl MetadataRecord for FoiInfo {
    fn producer_key(&self) -> Vec<u8> {
        uid_key(&self.uid)
    }
    fn valid_start(&self) -> Time {
        self.valid_start
    }
    fn set_valid_end(&mut self, end: Option<Time>) {
        self.valid_end = end;
    }
    fn valid_end(&self) -> Option<Time> {
        self.valid_end
    }
    fn text_sources(&self) -> Vec<String> {
        vec![self.uid.clone(), self.name.clone(), self.description.clone()]
    }
}

/// Generic selection parameters after nested filters are resolved.
struct MetaSelect<'a> {
    ids: Option<Vec<u64>>,
    producer_prefixes: Option<Vec<Vec<u8>>>,
    keywords: Option<&'a [String]>,
    valid_time: Option<TemporalFilter>,
    limit: Option<usize>,
}

/// The shared storage machinery for one metadata kind.
#[derive(Debug, Clone)]
pub struct VersionedStore<R: MetadataRecord> {
    store: SharedStore,
    ks_record: u8,
    ks_revisions: u8,
    ks_text: u8,
    next_id: Arc<AtomicU64>,
    codec: VersionedCodec,
    _marker: PhantomData<fn() -> R>,
}

impl<R: MetadataRecord> VersionedStore<R> {
    fn new(store: SharedStore, ks_record: u8, ks_revisions: u8, ks_text: u8) -> Self {
        Self {
            store,
            ks_record,
            ks_revisions,
            ks_text,
            next_id: Arc::new(AtomicU64::new(1)),
            codec: VersionedCodec,
            _marker: PhantomData,
        }
    }

    /// Insert a new revision: record, revision index entry and full-text
    /// postings are one compound mutation. Fails on a duplicate
    /// `(producer, valid-start)` pair.
    fn add_locked(&self, store: &mut OrderedStore, record: &R) -> HubResult<u64> {
        let rev_key = keys::revision_key(self.ks_revisions, &record.producer_key(), record.valid_start());
        if store.contains(&rev_key) {
            return Err(HubError::integrity(
                "a revision with this producer and valid-start already exists",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = self.codec.encode(record)?;
        store.insert(keys::record_key(self.ks_record, id), bytes);
        store.insert(rev_key, id.to_be_bytes().to_vec());
        for token in fulltext::tokenize_all(record.text_sources().iter().map(String::as_str)) {
            store.insert(keys::posting_key(self.ks_text, &token, id), Vec::new());
        }
        Ok(id)
    }

    fn add(&self, record: &R) -> HubResult<u64> {
        with_rollback(&self.store, |store| self.add_locked(store, record))
    }

    /// Fetch a record with its computed valid-time end.
    fn get(&self, id: u64) -> HubResult<Option<R>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        self.get_in(&guard, id)
    }

    fn get_in(&self, store: &OrderedStore, id: u64) -> HubResult<Option<R>> {
        let Some(bytes) = store.get(&keys::record_key(self.ks_record, id)) else {
            return Ok(None);
        };
        let mut record: R = self.codec.decode(bytes)?;
        let end = self.valid_end_in(store, &record.producer_key(), record.valid_start());
        record.set_valid_end(end);
        Ok(Some(record))
    }

    /// A revision's displayed end is the next revision's start, if any.
    fn valid_end_in(&self, store: &OrderedStore, producer: &[u8], start: Time) -> Option<Time> {
        let mut next: Option<Time> = None;
        for (_, other_start) in self.revisions_in(store, producer) {
            if other_start > start && next.is_none_or(|n| other_start < n) {
                next = Some(other_start);
            }
        }
        next
    }

    /// All `(id, valid-start)` revisions of one producer, latest first.
    fn revisions_in(&self, store: &OrderedStore, producer: &[u8]) -> Vec<(u64, Time)> {
        let mut prefix = vec![self.ks_revisions];
        prefix.extend_from_slice(producer);
        let end = prefix_end(&prefix);
        store
            .scan(Bound::Included(prefix.as_slice()), end.as_deref(), usize::MAX)
            .into_iter()
            .filter_map(|(k, v)| {
                let inverted = k.get(prefix.len()..)?;
                if inverted.len() != keys::TIME_LEN {
                    return None;
                }
                let restored: Vec<u8> = inverted.iter().map(|b| !b).collect();
                let start = keys::decode_time(&restored)?;
                let id = u64::from_be_bytes(v.as_slice().try_into().ok()?);
                Some((id, start))
            })
            .collect()
    }

    /// The latest revision of one producer: a single bounded range probe.
    fn latest_for(&self, producer: &[u8]) -> HubResult<Option<(u64, R)>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut prefix = vec![self.ks_revisions];
        prefix.extend_from_slice(producer);
        let Some((key, value)) = guard.ceiling(&prefix) else {
            return Ok(None);
        };
        if !key.starts_with(&prefix) {
            return Ok(None);
        }
        let id = u64::from_be_bytes(
            value
                .as_slice()
                .try_into()
                .map_err(|_| HubError::Decode("revision entry".into()))?,
        );
        Ok(self.get_in(&guard, id)?.map(|r| (id, r)))
    }

    /// The revision valid at `t`: the first probe hit at or before `t` in
    /// the inverted ordering.
    fn as_of(&self, producer: &[u8], t: Time) -> HubResult<Option<(u64, R)>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut prefix = vec![self.ks_revisions];
        prefix.extend_from_slice(producer);
        let probe = keys::revision_key(self.ks_revisions, producer, t);
        let Some((key, value)) = guard.ceiling(&probe) else {
            return Ok(None);
        };
        if !key.starts_with(&prefix) {
            return Ok(None);
        }
        let id = u64::from_be_bytes(
            value
                .as_slice()
                .try_into()
                .map_err(|_| HubError::Decode("revision entry".into()))?,
        );
        Ok(self.get_in(&guard, id)?.map(|r| (id, r)))
    }

    /// Overwrite the record stored under `id`. All three indexes stay
    /// consistent; any failure rolls the whole mutation back.
    fn put(&self, id: u64, record: &R, allow_replace: bool) -> HubResult<()> {
        with_rollback(&self.store, |store| self.put_locked(store, id, record, allow_replace))
    }

    fn put_locked(
        &self,
        store: &mut OrderedStore,
        id: u64,
        record: &R,
        allow_replace: bool,
    ) -> HubResult<()> {
        let record_key = keys::record_key(self.ks_record, id);
        let Some(old_bytes) = store.get(&record_key).cloned() else {
            return Err(HubError::integrity(format!("no record with id {id}")));
        };
        if !allow_replace {
            return Err(HubError::integrity(format!(
                "record {id} already exists and replacement was not allowed"
            )));
        }
        let old: R = self.codec.decode(&old_bytes)?;

        let old_rev = keys::revision_key(self.ks_revisions, &old.producer_key(), old.valid_start());
        let new_rev = keys::revision_key(self.ks_revisions, &record.producer_key(), record.valid_start());
        if old_rev != new_rev {
            if store.contains(&new_rev) {
                return Err(HubError::integrity(
                    "another revision already occupies this producer and valid-start",
                ));
            }
            store.remove(&old_rev);
            store.insert(new_rev, id.to_be_bytes().to_vec());
        }

        for token in fulltext::tokenize_all(old.text_sources().iter().map(String::as_str)) {
            store.remove(&keys::posting_key(self.ks_text, &token, id));
        }
        for token in fulltext::tokenize_all(record.text_sources().iter().map(String::as_str)) {
            store.insert(keys::posting_key(self.ks_text, &token, id), Vec::new());
        }
        store.insert(record_key, self.codec.encode(record)?);
        Ok(())
    }

    /// Remove record, revision entry and postings, returning the old record.
    fn remove_locked(&self, store: &mut OrderedStore, id: u64) -> HubResult<Option<R>> {
        let Some(bytes) = store.remove(&keys::record_key(self.ks_record, id)) else {
            return Ok(None);
        };
        let old: R = self.codec.decode(&bytes)?;
        store.remove(&keys::revision_key(self.ks_revisions, &old.producer_key(), old.valid_start()));
        for token in fulltext::tokenize_all(old.text_sources().iter().map(String::as_str)) {
            store.remove(&keys::posting_key(self.ks_text, &token, id));
        }
        Ok(Some(old))
    }

    fn remove(&self, id: u64) -> HubResult<Option<R>> {
        with_rollback(&self.store, |store| self.remove_locked(store, id))
    }

    /// Every stored revision id of one producer, latest first.
    fn revision_ids(&self, producer: &[u8]) -> Vec<u64> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        self.revisions_in(&guard, producer)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Candidate ids from the full-text index: ids whose tokens cover every
    /// keyword (prefix match).
    fn ids_for_keywords(&self, store: &OrderedStore, keywords: &[String]) -> BTreeSet<u64> {
        let mut result: Option<BTreeSet<u64>> = None;
        for kw in keywords {
            let mut prefix = vec![self.ks_text];
            prefix.extend_from_slice(kw.to_lowercase().as_bytes());
            let end = prefix_end(&prefix);
            let ids: BTreeSet<u64> = store
                .scan(Bound::Included(prefix.as_slice()), end.as_deref(), usize::MAX)
                .into_iter()
                .filter_map(|(k, _)| {
                    let tail = k.get(k.len() - 8..)?;
                    Some(u64::from_be_bytes(tail.try_into().ok()?))
                })
                .collect();
            result = Some(match result {
                Some(acc) => acc.intersection(&ids).copied().collect(),
                None => ids,
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        result.unwrap_or_default()
    }

    /// Every stored record. Metadata sets are small enough to materialize.
    fn all_ids(&self, store: &OrderedStore) -> Vec<u64> {
        let prefix = [self.ks_record];
        let end = prefix_end(&prefix);
        store
            .scan(Bound::Included(&prefix[..]), end.as_deref(), usize::MAX)
            .into_iter()
            .filter_map(|(k, _)| Some(u64::from_be_bytes(k.get(1..9)?.try_into().ok()?)))
            .collect()
    }

    /// Generic select: explicit ids win; otherwise producer prefixes, then
    /// the full-text index, then a full scan. Keywords always post-filter
    /// (the index is a candidate generator), valid time post-filters on the
    /// computed interval. The limit counts accepted records only, so every
    /// post-filter must run before it; typed stores fold their extra
    /// dimensions into `post` rather than trimming after the fact.
    fn select(
        &self,
        sel: MetaSelect<'_>,
        post: impl Fn(u64, &R) -> bool,
    ) -> HubResult<Vec<(u64, R)>> {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());

        let candidate_ids: Vec<u64> = if let Some(ids) = sel.ids {
            ids
        } else if let Some(prefixes) = &sel.producer_prefixes {
            let mut ids = Vec::new();
            for producer in prefixes {
                ids.extend(self.revisions_in(&guard, producer).into_iter().map(|(id, _)| id));
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        } else if let Some(keywords) = sel.keywords {
            self.ids_for_keywords(&guard, keywords).into_iter().collect()
        } else {
            self.all_ids(&guard)
        };

        let now = Time::now();
        let mut out = Vec::new();
        for id in candidate_ids {
            let Some(record) = self.get_in(&guard, id)? else {
                continue;
            };
            if let Some(keywords) = sel.keywords {
                let sources = record.text_sources();
                if !fulltext::matches_keywords(sources.iter().map(String::as_str), keywords) {
                    continue;
                }
            }
            if let Some(tf) = sel.valid_time {
                if let Some(extent) = tf.to_extent(now) {
                    let end = record.valid_end().unwrap_or(Time::MAX);
                    let interval = TimeExtent::new(record.valid_start(), end);
                    if !interval.intersects(&extent) {
                        continue;
                    }
                }
            }
            if !post(id, &record) {
                continue;
            }
            out.push((id, record));
            if sel.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

/// Store of versioned system descriptions, keyed by stable uid.
#[derive(Debug, Clone)]
pub struct SystemStore {
    inner: VersionedStore<SystemInfo>,
}

impl SystemStore {
    /// Create a handle over `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: VersionedStore::new(store, ks::SYS_RECORD, ks::SYS_REVISIONS, ks::SYS_TEXT),
        }
    }

    /// Insert a brand-new system. Fails if the uid already has revisions.
    pub fn add(&self, info: SystemInfo) -> HubResult<SystemId> {
        check_identifier("system uid", &info.uid)?;
        if self.latest_by_uid(&info.uid)?.is_some() {
            return Err(HubError::integrity(format!(
                "system uid '{}' already registered",
                info.uid
            )));
        }
        Ok(SystemId(self.inner.add(&info)?))
    }

    /// Look up one revision by id.
    pub fn get(&self, id: SystemId) -> HubResult<Option<SystemInfo>> {
        self.inner.get(id.0)
    }

    /// Overwrite a revision in place.
    pub fn put(&self, id: SystemId, info: &SystemInfo, allow_replace: bool) -> HubResult<()> {
        check_identifier("system uid", &info.uid)?;
        self.inner.put(id.0, info, allow_replace)
    }

    /// Remove one revision.
    pub fn remove(&self, id: SystemId) -> HubResult<Option<SystemInfo>> {
        self.inner.remove(id.0)
    }

    /// The latest revision registered under a uid.
    pub fn latest_by_uid(&self, uid: &str) -> HubResult<Option<(SystemId, SystemInfo)>> {
        Ok(self
            .inner
            .latest_for(&uid_key(uid))?
            .map(|(id, info)| (SystemId(id), info)))
    }

    /// Every revision id registered under a uid, latest first.
    pub fn revision_ids(&self, uid: &str) -> Vec<SystemId> {
        self.inner.revision_ids(&uid_key(uid)).into_iter().map(SystemId).collect()
    }

    /// The revision of a uid valid at `t`.
    pub fn by_uid_as_of(&self, uid: &str, t: Time) -> HubResult<Option<(SystemId, SystemInfo)>> {
        Ok(self
            .inner
            .as_of(&uid_key(uid), t)?
            .map(|(id, info)| (SystemId(id), info)))
    }

    /// Apply the versioning rule for systems: a later valid-start creates a
    /// new revision, the same valid-start overwrites in place, identical
    /// content is a no-op.
    pub fn add_or_update(&self, info: SystemInfo) -> HubResult<(SystemId, UpdateOutcome)> {
        check_identifier("system uid", &info.uid)?;
        match self.latest_by_uid(&info.uid)? {
            None => Ok((SystemId(self.inner.add(&info)?), UpdateOutcome::Added)),
            Some((id, existing)) => {
                if info.valid_start > existing.valid_start {
                    Ok((SystemId(self.inner.add(&info)?), UpdateOutcome::NewRevision))
                } else if info.valid_start == existing.valid_start {
                    if info.name == existing.name
                        && info.description == existing.description
                        && info.parent == existing.parent
                    {
                        Ok((id, UpdateOutcome::Unchanged))
                    } else {
                        self.inner.put(id.0, &info, true)?;
                        Ok((id, UpdateOutcome::Replaced))
                    }
                } else {
                    Err(HubError::integrity(
                        "revision predates the latest stored revision",
                    ))
                }
            }
        }
    }

    /// Select systems. `child_producers` is the resolved nested datastream
    /// dimension: only systems in the set qualify (None = unconstrained).
    pub fn select(
        &self,
        filter: &SystemFilter,
        child_producers: Option<&BTreeSet<SystemId>>,
    ) -> HubResult<Vec<(SystemId, SystemInfo)>> {
        filter.validate()?;
        let sel = MetaSelect {
            ids: filter
                .internal_ids
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.0).collect()),
            producer_prefixes: filter
                .uids
                .as_ref()
                .map(|uids| uids.iter().map(|uid| uid_key(uid)).collect()),
            keywords: filter.keywords.as_deref(),
            valid_time: filter.valid_time,
            limit: filter.limit,
        };
        let parents = filter.parents.clone();
        let rows = self.inner.select(sel, |id, info: &SystemInfo| {
            if let Some(parents) = &parents {
                let effective = info.parent.unwrap_or(SystemId::NO_PARENT);
                if !parents.contains(&effective) {
                    return false;
                }
            }
            child_producers.is_none_or(|members| members.contains(&SystemId(id)))
        })?;
        Ok(rows
            .into_iter()
            .map(|(id, info)| (SystemId(id), info))
            .collect())
    }

    /// Direct members of a group.
    pub fn members_of(&self, parent: SystemId) -> HubResult<Vec<(SystemId, SystemInfo)>> {
        self.select(
            &SystemFilter::all().with_parents([parent]),
            None,
        )
    }

    /// Walk the parent chain from `id` upward (nearest ancestor first).
    pub fn ancestors(&self, id: SystemId) -> HubResult<Vec<(SystemId, SystemInfo)>> {
        let mut out = Vec::new();
        let mut cursor = self.get(id)?.and_then(|info| info.parent);
        while let Some(parent_id) = cursor {
            let Some(info) = self.get(parent_id)? else {
                break;
            };
            cursor = info.parent;
            out.push((parent_id, info));
            if out.len() > 64 {
                return Err(HubError::integrity("system parent chain forms a cycle"));
            }
        }
        Ok(out)
    }
}

/// Verify the invariant that a schema's embedded name matches the declared
/// output/control name.
fn check_schema_name(schema: &JsonValue, declared: &str) -> HubResult<()> {
    if let Some(embedded) = schema.get("name").and_then(JsonValue::as_str) {
        if embedded != declared {
            return Err(HubError::validation(format!(
                "schema declares name '{embedded}' but the stream is named '{declared}'"
            )));
        }
    }
    Ok(())
}

/// The five-case add-or-update revisioning rule shared by datastreams and
/// command streams.
#[allow(clippy::too_many_arguments)]
fn stream_add_or_update<R: MetadataRecord>(
    inner: &VersionedStore<R>,
    existing: Option<(u64, R)>,
    mut candidate: R,
    schema_of: impl Fn(&R) -> &JsonValue,
    encoding_of: impl Fn(&R) -> &JsonValue,
    cosmetic_eq: impl Fn(&R, &R) -> bool,
    set_valid_start: impl Fn(&mut R, Time),
    has_observations: bool,
    compat: &dyn SchemaCompat,
) -> HubResult<(u64, UpdateOutcome)> {
    let Some((id, existing)) = existing else {
        // Case 1: nothing stored yet.
        return Ok((inner.add(&candidate)?, UpdateOutcome::Added));
    };

    let schema_eq = compat.structurally_equal(schema_of(&existing), schema_of(&candidate));
    let encoding_eq = compat.encoding_equal(encoding_of(&existing), encoding_of(&candidate));

    if schema_eq && encoding_eq {
        if cosmetic_eq(&existing, &candidate) {
            // Case 5: nothing changed.
            return Ok((id, UpdateOutcome::Unchanged));
        }
        // Case 4: cosmetic-only change overwrites in place.
        set_valid_start(&mut candidate, existing.valid_start());
        inner.put(id, &candidate, true)?;
        return Ok((id, UpdateOutcome::Replaced));
    }

    if !has_observations {
        // Case 2: no recorded data yet, free to rewrite the revision.
        set_valid_start(&mut candidate, existing.valid_start());
        inner.put(id, &candidate, true)?;
        return Ok((id, UpdateOutcome::Replaced));
    }

    let compatible =
        encoding_eq && compat.structurally_compatible(schema_of(&existing), schema_of(&candidate));
    if compatible {
        // Compatible widening keeps the revision.
        set_valid_start(&mut candidate, existing.valid_start());
        inner.put(id, &candidate, true)?;
        return Ok((id, UpdateOutcome::Replaced));
    }

    // Case 3: incompatible change with recorded data: preserve history by
    // inserting a new revision starting now (clamped past the existing one).
    let mut start = Time::now();
    if start <= existing.valid_start() {
        start = Time::new(existing.valid_start().seconds, existing.valid_start().nanos + 1);
    }
    set_valid_start(&mut candidate, start);
    Ok((inner.add(&candidate)?, UpdateOutcome::NewRevision))
}

/// Store of versioned datastream metadata.
#[derive(Debug, Clone)]
pub struct DataStreamStore {
    inner: VersionedStore<DataStreamInfo>,
}

impl DataStreamStore {
    /// Create a handle over `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: VersionedStore::new(store, ks::DS_RECORD, ks::DS_REVISIONS, ks::DS_TEXT),
        }
    }

    /// Insert a brand-new datastream. Fails if the system already exposes a
    /// datastream with this output name.
    pub fn add(&self, info: DataStreamInfo) -> HubResult<DataStreamId> {
        check_identifier("output name", &info.output_name)?;
        check_schema_name(&info.schema, &info.output_name)?;
        if self.latest_for_output(info.system, &info.output_name)?.is_some() {
            return Err(HubError::integrity(format!(
                "system {} already exposes output '{}'",
                info.system, info.output_name
            )));
        }
        Ok(DataStreamId(self.inner.add(&info)?))
    }

    /// Look up one revision by id (valid end computed).
    pub fn get(&self, id: DataStreamId) -> HubResult<Option<DataStreamInfo>> {
        self.inner.get(id.0)
    }

    /// Overwrite a revision in place.
    pub fn put(&self, id: DataStreamId, info: &DataStreamInfo, allow_replace: bool) -> HubResult<()> {
        check_identifier("output name", &info.output_name)?;
        check_schema_name(&info.schema, &info.output_name)?;
        self.inner.put(id.0, info, allow_replace)
    }

    /// The latest revision of one system output.
    pub fn latest_for_output(
        &self,
        system: SystemId,
        output: &str,
    ) -> HubResult<Option<(DataStreamId, DataStreamInfo)>> {
        Ok(self
            .inner
            .latest_for(&producer_key_for(system, output))?
            .map(|(id, info)| (DataStreamId(id), info)))
    }

    /// Every revision id of one system output, latest first.
    pub fn revision_ids_for_output(&self, system: SystemId, output: &str) -> Vec<DataStreamId> {
        self.inner
            .revision_ids(&producer_key_for(system, output))
            .into_iter()
            .map(DataStreamId)
            .collect()
    }

    /// The revision of one system output valid at `t`.
    pub fn for_output_as_of(
        &self,
        system: SystemId,
        output: &str,
        t: Time,
    ) -> HubResult<Option<(DataStreamId, DataStreamInfo)>> {
        Ok(self
            .inner
            .as_of(&producer_key_for(system, output), t)?
            .map(|(id, info)| (DataStreamId(id), info)))
    }

    /// Apply the revisioning rule (see [`UpdateOutcome`]): overwrite when no
    /// data was recorded or the change is compatible/cosmetic, insert a new
    /// revision when an incompatible change meets recorded observations.
    pub fn add_or_update(
        &self,
        candidate: DataStreamInfo,
        has_observations: bool,
        compat: &dyn SchemaCompat,
    ) -> HubResult<(DataStreamId, UpdateOutcome)> {
        check_identifier("output name", &candidate.output_name)?;
        check_schema_name(&candidate.schema, &candidate.output_name)?;
        let existing = self
            .latest_for_output(candidate.system, &candidate.output_name)?
            .map(|(id, info)| (id.0, info));
        let (id, outcome) = stream_add_or_update(
            &self.inner,
            existing,
            candidate,
            |r| &r.schema,
            |r| &r.encoding,
            |a, b| a.name == b.name && a.description == b.description,
            |r, t| r.valid_start = t,
            has_observations,
            compat,
        )?;
        Ok((DataStreamId(id), outcome))
    }

    /// Remove one revision (the caller cascades observations first).
    pub fn remove(&self, id: DataStreamId) -> HubResult<Option<DataStreamInfo>> {
        self.inner.remove(id.0)
    }

    pub(crate) fn remove_locked(
        &self,
        store: &mut OrderedStore,
        id: DataStreamId,
    ) -> HubResult<Option<DataStreamInfo>> {
        self.inner.remove_locked(store, id.0)
    }

    /// Select datastreams. `producers` is the resolved nested system
    /// dimension (None = unconstrained).
    pub fn select(
        &self,
        filter: &DataStreamFilter,
        producers: Option<&BTreeSet<SystemId>>,
    ) -> HubResult<Vec<(DataStreamId, DataStreamInfo)>> {
        filter.validate()?;
        let producer_prefixes = producers.map(|systems| {
            let mut prefixes = Vec::new();
            for &system in systems {
                match &filter.output_names {
                    Some(names) => {
                        for name in names {
                            prefixes.push(producer_key_for(system, name));
                        }
                    }
                    None => prefixes.push(system.0.to_be_bytes().to_vec()),
                }
            }
            prefixes
        });
        let sel = MetaSelect {
            ids: filter
                .internal_ids
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.0).collect()),
            producer_prefixes,
            keywords: filter.keywords.as_deref(),
            valid_time: filter.valid_time,
            limit: filter.limit,
        };
        let output_names = filter.output_names.clone();
        let producer_set = producers.cloned();
        let rows = self.inner.select(sel, |_, info: &DataStreamInfo| {
            output_names
                .as_ref()
                .is_none_or(|names| names.contains(&info.output_name))
                && producer_set
                    .as_ref()
                    .is_none_or(|systems| systems.contains(&info.system))
        })?;
        Ok(rows
            .into_iter()
            .map(|(id, info)| (DataStreamId(id), info))
            .collect())
    }

    /// Ids of every datastream revision belonging to `system`.
    pub fn ids_for_system(&self, system: SystemId) -> HubResult<Vec<DataStreamId>> {
        let rows = self.select(
            &DataStreamFilter::all(),
            Some(&BTreeSet::from([system])),
        )?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }
}

/// Store of versioned command stream metadata.
#[derive(Debug, Clone)]
pub struct CommandStreamStore {
    inner: VersionedStore<CommandStreamInfo>,
}

impl CommandStreamStore {
    /// Create a handle over `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: VersionedStore::new(store, ks::CS_RECORD, ks::CS_REVISIONS, ks::CS_TEXT),
        }
    }

    /// Insert a brand-new command stream. Fails if the system already has a
    /// control with this name.
    pub fn add(&self, info: CommandStreamInfo) -> HubResult<CommandStreamId> {
        check_identifier("control name", &info.control_name)?;
        check_schema_name(&info.schema, &info.control_name)?;
        if self
            .latest_for_control(info.system, &info.control_name)?
            .is_some()
        {
            return Err(HubError::integrity(format!(
                "system {} already accepts control '{}'",
                info.system, info.control_name
            )));
        }
        Ok(CommandStreamId(self.inner.add(&info)?))
    }

    /// Look up one revision by id (valid end computed).
    pub fn get(&self, id: CommandStreamId) -> HubResult<Option<CommandStreamInfo>> {
        self.inner.get(id.0)
    }

    /// Overwrite a revision in place.
    pub fn put(
        &self,
        id: CommandStreamId,
        info: &CommandStreamInfo,
        allow_replace: bool,
    ) -> HubResult<()> {
        check_identifier("control name", &info.control_name)?;
        check_schema_name(&info.schema, &info.control_name)?;
        self.inner.put(id.0, info, allow_replace)
    }

    /// The latest revision of one system control.
    pub fn latest_for_control(
        &self,
        system: SystemId,
        control: &str,
    ) -> HubResult<Option<(CommandStreamId, CommandStreamInfo)>> {
        Ok(self
            .inner
            .latest_for(&producer_key_for(system, control))?
            .map(|(id, info)| (CommandStreamId(id), info)))
    }

    /// Every revision id of one system control, latest first.
    pub fn revision_ids_for_control(&self, system: SystemId, control: &str) -> Vec<CommandStreamId> {
        self.inner
            .revision_ids(&producer_key_for(system, control))
            .into_iter()
            .map(CommandStreamId)
            .collect()
    }

    /// Apply the revisioning rule; `has_commands` plays the role recorded
    /// observations play for datastreams.
    pub fn add_or_update(
        &self,
        candidate: CommandStreamInfo,
        has_commands: bool,
        compat: &dyn SchemaCompat,
    ) -> HubResult<(CommandStreamId, UpdateOutcome)> {
        check_identifier("control name", &candidate.control_name)?;
        check_schema_name(&candidate.schema, &candidate.control_name)?;
        let existing = self
            .latest_for_control(candidate.system, &candidate.control_name)?
            .map(|(id, info)| (id.0, info));
        let (id, outcome) = stream_add_or_update(
            &self.inner,
            existing,
            candidate,
            |r| &r.schema,
            |r| &r.encoding,
            |a, b| a.name == b.name && a.description == b.description,
            |r, t| r.valid_start = t,
            has_commands,
            compat,
        )?;
        Ok((CommandStreamId(id), outcome))
    }

    /// Remove one revision.
    pub fn remove(&self, id: CommandStreamId) -> HubResult<Option<CommandStreamInfo>> {
        self.inner.remove(id.0)
    }

    /// Select command streams. `producers` is the resolved nested system
    /// dimension (None = unconstrained).
    pub fn select(
        &self,
        filter: &CommandStreamFilter,
        producers: Option<&BTreeSet<SystemId>>,
    ) -> HubResult<Vec<(CommandStreamId, CommandStreamInfo)>> {
        filter.validate()?;
        let producer_prefixes = producers.map(|systems| {
            let mut prefixes = Vec::new();
            for &system in systems {
                match &filter.control_names {
                    Some(names) => {
                        for name in names {
                            prefixes.push(producer_key_for(system, name));
                        }
                    }
                    None => prefixes.push(system.0.to_be_bytes().to_vec()),
                }
            }
            prefixes
        });
        let sel = MetaSelect {
            ids: filter
                .internal_ids
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.0).collect()),
            producer_prefixes,
            keywords: filter.keywords.as_deref(),
            valid_time: filter.valid_time,
            limit: filter.limit,
        };
        let control_names = filter.control_names.clone();
        let producer_set = producers.cloned();
        let rows = self.inner.select(sel, |_, info: &CommandStreamInfo| {
            control_names
                .as_ref()
                .is_none_or(|names| names.contains(&info.control_name))
                && producer_set
                    .as_ref()
                    .is_none_or(|systems| systems.contains(&info.system))
        })?;
        Ok(rows
            .into_iter()
            .map(|(id, info)| (CommandStreamId(id), info))
            .collect())
    }

    /// Ids of every command stream revision belonging to `system`.
    pub fn ids_for_system(&self, system: SystemId) -> HubResult<Vec<CommandStreamId>> {
        let rows = self.select(&CommandStreamFilter::all(), Some(&BTreeSet::from([system])))?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }
}

/// Store of versioned feature-of-interest descriptions, keyed by uid.
#[derive(Debug, Clone)]
pub struct FoiStore {
    inner: VersionedStore<FoiInfo>,
}

impl FoiStore {
    /// Create a handle over `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            inner: VersionedStore::new(store, ks::FOI_RECORD, ks::FOI_REVISIONS, ks::FOI_TEXT),
        }
    }

    /// Insert a brand-new feature. Fails if the uid already has revisions.
    pub fn add(&self, info: FoiInfo) -> HubResult<FoiId> {
        check_identifier("feature uid", &info.uid)?;
        if self.latest_by_uid(&info.uid)?.is_some() {
            return Err(HubError::integrity(format!(
                "feature uid '{}' already registered",
                info.uid
            )));
        }
        Ok(FoiId(self.inner.add(&info)?))
    }

    /// Look up one revision by id.
    pub fn get(&self, id: FoiId) -> HubResult<Option<FoiInfo>> {
        self.inner.get(id.0)
    }

    /// Overwrite a revision in place.
    pub fn put(&self, id: FoiId, info: &FoiInfo, allow_replace: bool) -> HubResult<()> {
        check_identifier("feature uid", &info.uid)?;
        self.inner.put(id.0, info, allow_replace)
    }

    /// Remove one revision.
    pub fn remove(&self, id: FoiId) -> HubResult<Option<FoiInfo>> {
        self.inner.remove(id.0)
    }

    /// The latest revision registered under a uid.
    pub fn latest_by_uid(&self, uid: &str) -> HubResult<Option<(FoiId, FoiInfo)>> {
        Ok(self
            .inner
            .latest_for(&uid_key(uid))?
            .map(|(id, info)| (FoiId(id), info)))
    }

    /// Every revision id registered under a uid, latest first.
    pub fn revision_ids(&self, uid: &str) -> Vec<FoiId> {
        self.inner.revision_ids(&uid_key(uid)).into_iter().map(FoiId).collect()
    }

    /// Apply the versioning rule for features (same shape as systems).
    pub fn add_or_update(&self, info: FoiInfo) -> HubResult<(FoiId, UpdateOutcome)> {
        check_identifier("feature uid", &info.uid)?;
        match self.latest_by_uid(&info.uid)? {
            None => Ok((FoiId(self.inner.add(&info)?), UpdateOutcome::Added)),
            Some((id, existing)) => {
                if info.valid_start > existing.valid_start {
                    Ok((FoiId(self.inner.add(&info)?), UpdateOutcome::NewRevision))
                } else if info.valid_start == existing.valid_start {
                    if info.name == existing.name
                        && info.description == existing.description
                        && info.parent_system == existing.parent_system
                    {
                        Ok((id, UpdateOutcome::Unchanged))
                    } else {
                        self.inner.put(id.0, &info, true)?;
                        Ok((id, UpdateOutcome::Replaced))
                    }
                } else {
                    Err(HubError::integrity(
                        "revision predates the latest stored revision",
                    ))
                }
            }
        }
    }

    /// Select features. `parents` is the resolved nested parent-system
    /// dimension (None = unconstrained); `FoiId` sets come pre-decoded.
    pub fn select(
        &self,
        filter: &FoiFilter,
        parents: Option<&BTreeSet<SystemId>>,
    ) -> HubResult<Vec<(FoiId, FoiInfo)>> {
        filter.validate()?;
        let sel = MetaSelect {
            ids: filter
                .internal_ids
                .as_ref()
                .map(|ids| ids.iter().map(|id| id.0).collect()),
            producer_prefixes: filter
                .uids
                .as_ref()
                .map(|uids| uids.iter().map(|uid| uid_key(uid)).collect()),
            keywords: filter.keywords.as_deref(),
            valid_time: filter.valid_time,
            limit: filter.limit,
        };
        let parent_set = parents.cloned();
        let rows = self.inner.select(sel, |_, info: &FoiInfo| {
            parent_set.as_ref().is_none_or(|systems| {
                let effective = info.parent_system.unwrap_or(SystemId::NO_PARENT);
                systems.contains(&effective)
            })
        })?;
        Ok(rows.into_iter().map(|(id, info)| (FoiId(id), info)).collect())
    }

    /// Ids of every feature attached to `system`.
    pub fn ids_for_system(&self, system: SystemId) -> HubResult<Vec<FoiId>> {
        let rows = self.select(&FoiFilter::all(), Some(&BTreeSet::from([system])))?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }
}
