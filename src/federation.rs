/// Federation of physical stores behind one query surface.
///
/// Each registered [`LocalDatabase`] gets a database number (a `u8`, so at
/// most 256 members). Public ids are the bijective packing of
/// `(database number, local id)` from [`crate::keys`]: the low byte selects
/// the database, the rest is the local id, and distinct pairs never collide.
/// Public observation keys prepend the database number byte to the packed
/// local key.
///
/// Query dispatch works off the filter's explicit ids: a filter whose id
/// sets localize to nothing for a member skips that member entirely, while
/// filters without explicit ids (keywords, nested filters, the no-parent
/// sentinel) broadcast to every member. Observation results merge lazily in
/// phenomenon-time order across members; metadata results concatenate in
/// member order. All ids inside returned records are translated to public
/// form before they leave this layer.
use crate::database::LocalDatabase;
use crate::error::{HubError, HubResult};
use crate::filter::{
    CommandStreamFilter, DataStreamFilter, FoiFilter, ObsFilter, SystemFilter, TemporalFilter,
};
use crate::keys::{ObsKey, pack_public_id, split_public_id};
use crate::merge::SortedMerge;
use crate::types::{
    CommandStreamId, CommandStreamInfo, DataStreamId, DataStreamInfo, FoiId, FoiInfo, Observation,
    SystemId, SystemInfo,
};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Number of one federation member. Doubles as the public-id low byte.
pub type DbNum = u8;

/// Public identity of one observation: member number plus local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FederatedObsKey {
    /// The owning member.
    pub db: DbNum,
    /// The key within that member's store.
    pub local: ObsKey,
}

impl FederatedObsKey {
    /// Create a key.
    pub fn new(db: DbNum, local: ObsKey) -> Self {
        Self { db, local }
    }

    /// Encode to the public byte form: the member number byte, then the
    /// packed local key.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.db];
        buf.extend_from_slice(&self.local.encode());
        buf
    }

    /// Decode the public byte form; malformed bytes decode to `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&db, rest) = bytes.split_first()?;
        Some(Self {
            db,
            local: ObsKey::decode(rest)?,
        })
    }
}

impl std::fmt::Display for FederatedObsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{}", self.db, self.local)
    }
}

fn public(db: DbNum, local: u64) -> HubResult<u64> {
    pack_public_id(db, local).ok_or_else(|| {
        HubError::integrity(format!("local id {local} exceeds the packable range"))
    })
}

/// A lazy, phenomenon-time-ordered federated observation stream.
pub type FederatedObsStream = Box<dyn Iterator<Item = (FederatedObsKey, Observation)> + Send>;

/// Read surface over every registered member database.
#[derive(Debug, Clone, Default)]
pub struct FederatedDatabase {
    members: Arc<DashMap<DbNum, Arc<LocalDatabase>>>,
}

impl FederatedDatabase {
    /// Create an empty federation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member under `db`. Fails when the number is taken.
    pub fn register(&self, db: DbNum, database: Arc<LocalDatabase>) -> HubResult<()> {
        match self.members.entry(db) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HubError::integrity(format!(
                "database number {db} is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(database);
                tracing::info!(db, "registered federation member");
                Ok(())
            }
        }
    }

    /// Remove a member, returning its handle.
    pub fn unregister(&self, db: DbNum) -> Option<Arc<LocalDatabase>> {
        self.members.remove(&db).map(|(_, database)| database)
    }

    /// Look up one member.
    pub fn member(&self, db: DbNum) -> Option<Arc<LocalDatabase>> {
        self.members.get(&db).map(|entry| entry.clone())
    }

    /// Number of registered members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no member is registered.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in ascending database-number order. Queries iterate in this
    /// order so results are deterministic.
    fn ordered_members(&self) -> Vec<(DbNum, Arc<LocalDatabase>)> {
        let mut members: Vec<(DbNum, Arc<LocalDatabase>)> = self
            .members
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        members.sort_by_key(|(db, _)| *db);
        members
    }

    /// Select systems across the federation, returning public ids.
    pub fn select_systems(&self, filter: &SystemFilter) -> HubResult<Vec<(SystemId, SystemInfo)>> {
        filter.validate()?;
        let mut out = Vec::new();
        for (db, member) in self.ordered_members() {
            let Some(local_filter) = localize_system_filter(filter, db) else {
                continue;
            };
            for (id, mut info) in member.select_systems(&local_filter)? {
                if let Some(parent) = info.parent {
                    info.parent = Some(SystemId(public(db, parent.0)?));
                }
                out.push((SystemId(public(db, id.0)?), info));
                if filter.limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Select datastreams across the federation, returning public ids.
    pub fn select_datastreams(
        &self,
        filter: &DataStreamFilter,
    ) -> HubResult<Vec<(DataStreamId, DataStreamInfo)>> {
        filter.validate()?;
        let mut out = Vec::new();
        for (db, member) in self.ordered_members() {
            let Some(local_filter) = localize_datastream_filter(filter, db) else {
                continue;
            };
            for (id, mut info) in member.select_datastreams(&local_filter)? {
                info.system = SystemId(public(db, info.system.0)?);
                out.push((DataStreamId(public(db, id.0)?), info));
                if filter.limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Select command streams across the federation, returning public ids.
    pub fn select_command_streams(
        &self,
        filter: &CommandStreamFilter,
    ) -> HubResult<Vec<(CommandStreamId, CommandStreamInfo)>> {
        filter.validate()?;
        let mut out = Vec::new();
        for (db, member) in self.ordered_members() {
            let Some(local_filter) = localize_command_stream_filter(filter, db) else {
                continue;
            };
            for (id, mut info) in member.select_command_streams(&local_filter)? {
                info.system = SystemId(public(db, info.system.0)?);
                out.push((CommandStreamId(public(db, id.0)?), info));
                if filter.limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Select features of interest across the federation, returning public
    /// ids.
    pub fn select_fois(&self, filter: &FoiFilter) -> HubResult<Vec<(FoiId, FoiInfo)>> {
        filter.validate()?;
        let mut out = Vec::new();
        for (db, member) in self.ordered_members() {
            let Some(local_filter) = localize_foi_filter(filter, db) else {
                continue;
            };
            for (id, mut info) in member.select_fois(&local_filter)? {
                if let Some(parent) = info.parent_system {
                    info.parent_system = Some(SystemId(public(db, parent.0)?));
                }
                out.push((FoiId(public(db, id.0)?), info));
                if filter.limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Look up one observation by its public key.
    pub fn get_observation(&self, key: &FederatedObsKey) -> HubResult<Option<Observation>> {
        let Some(member) = self.member(key.db) else {
            return Ok(None);
        };
        let Some(mut obs) = member.observations().get(&key.local)? else {
            return Ok(None);
        };
        obs.datastream = DataStreamId(public(key.db, obs.datastream.0)?);
        if let Some(foi) = obs.foi {
            obs.foi = Some(FoiId(public(key.db, foi.0)?));
        }
        Ok(Some(obs))
    }

    /// Select observations across every participating member, merged lazily
    /// in phenomenon-time order. Members whose localized filter matches
    /// nothing are skipped before any scan starts. All ids in the stream are
    /// public.
    pub fn select_observations(&self, filter: &ObsFilter) -> HubResult<FederatedObsStream> {
        filter.validate()?;
        if filter.internal_ids.is_some() {
            return Err(HubError::validation(
                "federated selection takes public keys; use select_observations_by_keys",
            ));
        }

        let mut streams: Vec<FederatedObsStream> = Vec::new();
        for (db, member) in self.ordered_members() {
            let Some(local_filter) = localize_obs_filter(filter, db) else {
                continue;
            };
            let stream = member.select_observations(&local_filter)?;
            streams.push(Box::new(stream.filter_map(move |(key, obs)| {
                translate_observation(db, key, obs)
            })));
        }

        let merged = SortedMerge::new(streams, |(key, _): &(FederatedObsKey, Observation)| {
            key.local.phenomenon_time
        });
        Ok(match filter.limit {
            Some(limit) => Box::new(merged.take(limit)),
            None => Box::new(merged),
        })
    }

    /// Fetch observations by explicit public keys, in phenomenon-time order.
    /// Unknown keys and unknown members are skipped, not errors. The explicit
    /// key set wins over every index: a filter, when given, post-filters the
    /// fetched records through its temporal bounds and predicate, and its
    /// limit truncates the ordered result.
    pub fn select_observations_by_keys(
        &self,
        keys: &[FederatedObsKey],
        filter: Option<&ObsFilter>,
    ) -> HubResult<Vec<(FederatedObsKey, Observation)>> {
        if let Some(filter) = filter {
            filter.validate()?;
        }
        let phen = filter.and_then(|f| match f.phenomenon_time {
            Some(TemporalFilter::Range(extent)) => Some(extent),
            _ => None,
        });
        let result = filter.and_then(|f| match f.result_time {
            Some(TemporalFilter::Range(extent)) => Some(extent),
            _ => None,
        });
        let predicate = filter.and_then(|f| f.predicate.clone());

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(obs) = self.get_observation(key)? {
                if phen.is_none_or(|e| e.contains(obs.phenomenon_time))
                    && result.is_none_or(|e| e.contains(obs.result_time))
                    && predicate.as_ref().is_none_or(|p| p(&obs))
                {
                    out.push((*key, obs));
                }
            }
        }
        out.sort_by_key(|(key, _)| (key.local.phenomenon_time, key.db, key.local.series));
        if let Some(limit) = filter.and_then(|f| f.limit) {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Count observations matching a filter across the federation.
    pub fn count_observations(&self, filter: &ObsFilter) -> HubResult<usize> {
        Ok(self.select_observations(filter)?.count())
    }
}

/// Translate one member observation into public form. Local ids too large to
/// pack are skipped with a warning; they cannot be represented publicly.
fn translate_observation(
    db: DbNum,
    key: ObsKey,
    mut obs: Observation,
) -> Option<(FederatedObsKey, Observation)> {
    let Some(ds) = pack_public_id(db, obs.datastream.0) else {
        tracing::warn!(db, datastream = obs.datastream.0, "unpackable datastream id");
        return None;
    };
    obs.datastream = DataStreamId(ds);
    if let Some(foi) = obs.foi {
        let Some(public_foi) = pack_public_id(db, foi.0) else {
            tracing::warn!(db, foi = foi.0, "unpackable foi id");
            return None;
        };
        obs.foi = Some(FoiId(public_foi));
    }
    Some((FederatedObsKey::new(db, key), obs))
}

/// Narrow a set of public ids to one member's local ids. `None` means the
/// member holds none of them and can be skipped.
fn localize_ids<T: Ord>(
    public_ids: &BTreeSet<T>,
    db: DbNum,
    get: impl Fn(&T) -> u64,
    make: impl Fn(u64) -> T,
) -> Option<BTreeSet<T>> {
    let local: BTreeSet<T> = public_ids
        .iter()
        .filter_map(|id| {
            let (owner, local) = split_public_id(get(id));
            (owner == db).then(|| make(local))
        })
        .collect();
    if local.is_empty() { None } else { Some(local) }
}

fn localize_system_filter(filter: &SystemFilter, db: DbNum) -> Option<SystemFilter> {
    let mut local = filter.clone();
    if let Some(ids) = &filter.internal_ids {
        local.internal_ids = Some(localize_ids(ids, db, |id| id.0, SystemId)?);
    }
    if let Some(parents) = &filter.parents {
        // The no-parent sentinel is member-independent and forces broadcast;
        // real parent ids dispatch to their owning member.
        let mut narrowed = BTreeSet::new();
        if filter.wants_top_level() {
            narrowed.insert(SystemId::NO_PARENT);
        }
        for parent in parents {
            if *parent == SystemId::NO_PARENT {
                continue;
            }
            let (owner, local_id) = split_public_id(parent.0);
            if owner == db {
                narrowed.insert(SystemId(local_id));
            }
        }
        if narrowed.is_empty() {
            return None;
        }
        local.parents = Some(narrowed);
    }
    if let Some(nested) = &filter.datastreams {
        local.datastreams = Some(Box::new(localize_datastream_filter(nested, db)?));
    }
    Some(local)
}

fn localize_datastream_filter(filter: &DataStreamFilter, db: DbNum) -> Option<DataStreamFilter> {
    let mut local = filter.clone();
    if let Some(ids) = &filter.internal_ids {
        local.internal_ids = Some(localize_ids(ids, db, |id| id.0, DataStreamId)?);
    }
    if let Some(nested) = &filter.systems {
        local.systems = Some(Box::new(localize_system_filter(nested, db)?));
    }
    Some(local)
}

fn localize_command_stream_filter(
    filter: &CommandStreamFilter,
    db: DbNum,
) -> Option<CommandStreamFilter> {
    let mut local = filter.clone();
    if let Some(ids) = &filter.internal_ids {
        local.internal_ids = Some(localize_ids(ids, db, |id| id.0, CommandStreamId)?);
    }
    if let Some(nested) = &filter.systems {
        local.systems = Some(Box::new(localize_system_filter(nested, db)?));
    }
    Some(local)
}

fn localize_foi_filter(filter: &FoiFilter, db: DbNum) -> Option<FoiFilter> {
    let mut local = filter.clone();
    if let Some(ids) = &filter.internal_ids {
        local.internal_ids = Some(localize_ids(ids, db, |id| id.0, FoiId)?);
    }
    if let Some(nested) = &filter.parent_systems {
        local.parent_systems = Some(Box::new(localize_system_filter(nested, db)?));
    }
    Some(local)
}

fn localize_obs_filter(filter: &ObsFilter, db: DbNum) -> Option<ObsFilter> {
    let mut local = filter.clone();
    if let Some(nested) = &filter.datastreams {
        local.datastreams = Some(localize_datastream_filter(nested, db)?);
    }
    if let Some(nested) = &filter.fois {
        local.fois = Some(localize_foi_filter(nested, db)?);
    }
    Some(local)
}
