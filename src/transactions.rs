/// Transaction handlers: the mutation surface over one database.
///
/// Handlers address resources by stable uid (systems and features) or by
/// `(system uid, output/control name)` (streams), apply the versioning rules
/// of the underlying stores, and publish a lifecycle event after every
/// successful mutation. Deletion is guarded by default: a resource that
/// other resources still reference is refused with an integrity error
/// unless the caller asks for a cascade, in which case every dependent is
/// removed first and exactly one `Removed` event is published for the
/// resource the caller named.
///
/// Event publication follows the topic hierarchy: the entity topic first,
/// then each ancestor system's member topic from nearest to root, then the
/// resource registry topic.
use crate::database::LocalDatabase;
use crate::error::{HubError, HubResult};
use crate::events::{EventBus, EventKind, HubEvent, ResourceKind};
use crate::filter::{FoiFilter, ObsFilter};
use crate::types::{
    CommandStreamId, CommandStreamInfo, DataStreamId, DataStreamInfo, FoiId, FoiInfo, SystemId,
    SystemInfo, UpdateOutcome,
};
use dashmap::DashMap;
use std::sync::Arc;

/// State shared by every handler of one database.
#[derive(Debug, Clone)]
struct HandlerCtx {
    db: Arc<LocalDatabase>,
    events: EventBus,
    /// Enabled/disabled flags keyed by resource uid. Absent means enabled.
    status: Arc<DashMap<String, bool>>,
}

impl HandlerCtx {
    /// Uids of the ancestor chain above `parent`, nearest first.
    fn ancestor_uids(&self, parent: Option<SystemId>) -> HubResult<Vec<String>> {
        let mut out = Vec::new();
        let mut cursor = parent;
        while let Some(id) = cursor {
            let Some(info) = self.db.systems().get(id)? else {
                break;
            };
            cursor = info.parent;
            out.push(info.uid);
            if out.len() > 64 {
                return Err(HubError::integrity("system parent chain forms a cycle"));
            }
        }
        Ok(out)
    }

    /// Publish one event through the hierarchy: `chain` is the ancestor uid
    /// list, nearest first; its head becomes the event's parent uid.
    fn publish(&self, kind: EventKind, resource: ResourceKind, uid: &str, chain: &[String]) {
        let mut event = HubEvent::new(kind, resource, uid);
        if let Some(parent) = chain.first() {
            event = event.with_parent(parent.clone());
        }
        let rest: Vec<&str> = chain.iter().skip(1).map(String::as_str).collect();
        self.events.publish_hierarchy(event, rest);
    }

    fn set_status(
        &self,
        resource: ResourceKind,
        uid: &str,
        chain: &[String],
        enabled: bool,
    ) {
        self.status.insert(uid.to_string(), enabled);
        let kind = if enabled { EventKind::Enabled } else { EventKind::Disabled };
        self.publish(kind, resource, uid, chain);
    }

    fn is_enabled(&self, uid: &str) -> bool {
        self.status.get(uid).map(|flag| *flag).unwrap_or(true)
    }
}

/// The handler bundle for one database.
#[derive(Debug, Clone)]
pub struct DatabaseHandlers {
    systems: SystemHandler,
    datastreams: DataStreamHandler,
    command_streams: CommandStreamHandler,
    fois: FoiHandler,
}

impl DatabaseHandlers {
    /// Create handlers over `db`, publishing to `events`.
    pub fn new(db: Arc<LocalDatabase>, events: EventBus) -> Self {
        let ctx = HandlerCtx {
            db,
            events,
            status: Arc::new(DashMap::new()),
        };
        Self {
            systems: SystemHandler { ctx: ctx.clone() },
            datastreams: DataStreamHandler { ctx: ctx.clone() },
            command_streams: CommandStreamHandler { ctx: ctx.clone() },
            fois: FoiHandler { ctx },
        }
    }

    /// The system handler.
    pub fn systems(&self) -> &SystemHandler {
        &self.systems
    }

    /// The datastream handler.
    pub fn datastreams(&self) -> &DataStreamHandler {
        &self.datastreams
    }

    /// The command stream handler.
    pub fn command_streams(&self) -> &CommandStreamHandler {
        &self.command_streams
    }

    /// The feature-of-interest handler.
    pub fn fois(&self) -> &FoiHandler {
        &self.fois
    }
}

/// Mutations over systems.
#[derive(Debug, Clone)]
pub struct SystemHandler {
    ctx: HandlerCtx,
}

impl SystemHandler {
    /// Register or revise a system by uid.
    pub fn add_or_update(&self, info: SystemInfo) -> HubResult<(SystemId, UpdateOutcome)> {
        if let Some(parent) = info.parent {
            if self.ctx.db.systems().get(parent)?.is_none() {
                return Err(HubError::integrity(format!(
                    "parent system {parent} does not exist"
                )));
            }
        }
        let uid = info.uid.clone();
        let parent = info.parent;
        let (id, outcome) = self.ctx.db.systems().add_or_update(info)?;
        let kind = match outcome {
            UpdateOutcome::Added => Some(EventKind::Added),
            UpdateOutcome::Replaced | UpdateOutcome::NewRevision => Some(EventKind::Changed),
            UpdateOutcome::Unchanged => None,
        };
        if let Some(kind) = kind {
            let chain = self.ctx.ancestor_uids(parent)?;
            self.ctx.publish(kind, ResourceKind::System, &uid, &chain);
        }
        Ok((id, outcome))
    }

    /// Delete a system and all its revisions by uid.
    ///
    /// Without `cascade`, any remaining member system, datastream, command
    /// stream or attached feature refuses the delete. With `cascade` the
    /// whole subtree is removed first; one `Removed` event is published for
    /// this system only.
    pub fn delete(&self, uid: &str, cascade: bool) -> HubResult<()> {
        let Some((id, info)) = self.ctx.db.systems().latest_by_uid(uid)? else {
            return Err(HubError::integrity(format!("no system with uid '{uid}'")));
        };
        let chain = self.ctx.ancestor_uids(info.parent)?;

        if !cascade {
            let members = self.ctx.db.systems().members_of(id)?;
            let datastreams = self.ctx.db.datastreams().ids_for_system(id)?;
            let command_streams = self.ctx.db.command_streams().ids_for_system(id)?;
            let fois = self.ctx.db.fois().ids_for_system(id)?;
            if !members.is_empty()
                || !datastreams.is_empty()
                || !command_streams.is_empty()
                || !fois.is_empty()
            {
                return Err(HubError::integrity(format!(
                    "system '{uid}' still has dependent resources; delete with cascade"
                )));
            }
        }

        self.remove_tree(id, uid)?;
        self.ctx.status.remove(uid);
        self.ctx.publish(EventKind::Removed, ResourceKind::System, uid, &chain);
        Ok(())
    }

    /// Remove a system's subtree without publishing per-resource events.
    fn remove_tree(&self, id: SystemId, uid: &str) -> HubResult<()> {
        for (member_id, member) in self.ctx.db.systems().members_of(id)? {
            self.remove_tree(member_id, &member.uid)?;
        }
        for ds in self.ctx.db.datastreams().ids_for_system(id)? {
            self.ctx.db.remove_datastream(ds)?;
        }
        for cs in self.ctx.db.command_streams().ids_for_system(id)? {
            self.ctx.db.command_streams().remove(cs)?;
        }
        for foi in self.ctx.db.fois().ids_for_system(id)? {
            self.ctx.db.fois().remove(foi)?;
        }
        for revision in self.ctx.db.systems().revision_ids(uid) {
            self.ctx.db.systems().remove(revision)?;
        }
        Ok(())
    }

    /// Mark a system as receiving data and publish `Enabled`.
    pub fn enable(&self, uid: &str) -> HubResult<()> {
        self.set_enabled(uid, true)
    }

    /// Mark a system as not receiving data and publish `Disabled`.
    pub fn disable(&self, uid: &str) -> HubResult<()> {
        self.set_enabled(uid, false)
    }

    /// Whether a system is currently enabled (the default).
    pub fn is_enabled(&self, uid: &str) -> bool {
        self.ctx.is_enabled(uid)
    }

    fn set_enabled(&self, uid: &str, enabled: bool) -> HubResult<()> {
        let Some((_, info)) = self.ctx.db.systems().latest_by_uid(uid)? else {
            return Err(HubError::integrity(format!("no system with uid '{uid}'")));
        };
        let chain = self.ctx.ancestor_uids(info.parent)?;
        self.ctx.set_status(ResourceKind::System, uid, &chain, enabled);
        Ok(())
    }
}

/// Uid of one datastream or command stream: owning system uid plus name.
fn stream_uid(system_uid: &str, name: &str) -> String {
    format!("{system_uid}/{name}")
}

/// Mutations over datastreams.
#[derive(Debug, Clone)]
pub struct DataStreamHandler {
    ctx: HandlerCtx,
}

impl DataStreamHandler {
    /// Register or revise a datastream. The owning system must exist; the
    /// revisioning outcome depends on whether the current revision already
    /// recorded observations.
    pub fn add_or_update(&self, info: DataStreamInfo) -> HubResult<(DataStreamId, UpdateOutcome)> {
        let Some(system) = self.ctx.db.systems().get(info.system)? else {
            return Err(HubError::integrity(format!(
                "system {} does not exist",
                info.system
            )));
        };
        let has_observations = match self
            .ctx
            .db
            .datastreams()
            .latest_for_output(info.system, &info.output_name)?
        {
            Some((existing, _)) => self.ctx.db.datastream_has_observations(existing)?,
            None => false,
        };
        let uid = stream_uid(&system.uid, &info.output_name);
        let parent = info.system;
        let (id, outcome) =
            self.ctx
                .db
                .datastreams()
                .add_or_update(info, has_observations, self.ctx.db.schema_compat())?;
        let kind = match outcome {
            UpdateOutcome::Added => Some(EventKind::Added),
            UpdateOutcome::Replaced | UpdateOutcome::NewRevision => Some(EventKind::Changed),
            UpdateOutcome::Unchanged => None,
        };
        if let Some(kind) = kind {
            let chain = self.ctx.ancestor_uids(Some(parent))?;
            self.ctx.publish(kind, ResourceKind::DataStream, &uid, &chain);
        }
        Ok((id, outcome))
    }

    /// Delete every revision of one system output.
    ///
    /// Without `cascade`, recorded observations refuse the delete. With
    /// `cascade`, observations and series are removed with the revisions.
    pub fn delete(&self, system_uid: &str, output: &str, cascade: bool) -> HubResult<()> {
        let Some((system_id, _)) = self.ctx.db.systems().latest_by_uid(system_uid)? else {
            return Err(HubError::integrity(format!(
                "no system with uid '{system_uid}'"
            )));
        };
        let revisions = self.ctx.db.datastreams().revision_ids_for_output(system_id, output);
        if revisions.is_empty() {
            return Err(HubError::integrity(format!(
                "system '{system_uid}' has no output '{output}'"
            )));
        }
        if !cascade {
            for &revision in &revisions {
                if self.ctx.db.datastream_has_observations(revision)? {
                    return Err(HubError::integrity(format!(
                        "datastream '{output}' still has observations; delete with cascade"
                    )));
                }
            }
        }
        for revision in revisions {
            self.ctx.db.remove_datastream(revision)?;
        }

        let uid = stream_uid(system_uid, output);
        self.ctx.status.remove(&uid);
        let chain = self.ctx.ancestor_uids(Some(system_id))?;
        self.ctx.publish(EventKind::Removed, ResourceKind::DataStream, &uid, &chain);
        Ok(())
    }

    /// Mark a datastream as receiving data and publish `Enabled`.
    pub fn enable(&self, system_uid: &str, output: &str) -> HubResult<()> {
        self.set_enabled(system_uid, output, true)
    }

    /// Mark a datastream as not receiving data and publish `Disabled`.
    pub fn disable(&self, system_uid: &str, output: &str) -> HubResult<()> {
        self.set_enabled(system_uid, output, false)
    }

    /// Whether a datastream is currently enabled (the default).
    pub fn is_enabled(&self, system_uid: &str, output: &str) -> bool {
        self.ctx.is_enabled(&stream_uid(system_uid, output))
    }

    fn set_enabled(&self, system_uid: &str, output: &str, enabled: bool) -> HubResult<()> {
        let Some((system_id, _)) = self.ctx.db.systems().latest_by_uid(system_uid)? else {
            return Err(HubError::integrity(format!(
                "no system with uid '{system_uid}'"
            )));
        };
        if self
            .ctx
            .db
            .datastreams()
            .latest_for_output(system_id, output)?
            .is_none()
        {
            return Err(HubError::integrity(format!(
                "system '{system_uid}' has no output '{output}'"
            )));
        }
        let chain = self.ctx.ancestor_uids(Some(system_id))?;
        self.ctx
            .set_status(ResourceKind::DataStream, &stream_uid(system_uid, output), &chain, enabled);
        Ok(())
    }
}

/// Mutations over command streams.
#[derive(Debug, Clone)]
pub struct CommandStreamHandler {
    ctx: HandlerCtx,
}

impl CommandStreamHandler {
    /// Register or revise a command stream. The owning system must exist.
    pub fn add_or_update(
        &self,
        info: CommandStreamInfo,
    ) -> HubResult<(CommandStreamId, UpdateOutcome)> {
        let Some(system) = self.ctx.db.systems().get(info.system)? else {
            return Err(HubError::integrity(format!(
                "system {} does not exist",
                info.system
            )));
        };
        let uid = stream_uid(&system.uid, &info.control_name);
        let parent = info.system;
        // Command payloads are not stored, so revisions always overwrite
        // unless the change is incompatible by schema alone.
        let (id, outcome) =
            self.ctx
                .db
                .command_streams()
                .add_or_update(info, false, self.ctx.db.schema_compat())?;
        let kind = match outcome {
            UpdateOutcome::Added => Some(EventKind::Added),
            UpdateOutcome::Replaced | UpdateOutcome::NewRevision => Some(EventKind::Changed),
            UpdateOutcome::Unchanged => None,
        };
        if let Some(kind) = kind {
            let chain = self.ctx.ancestor_uids(Some(parent))?;
            self.ctx.publish(kind, ResourceKind::CommandStream, &uid, &chain);
        }
        Ok((id, outcome))
    }

    /// Delete every revision of one system control.
    pub fn delete(&self, system_uid: &str, control: &str) -> HubResult<()> {
        let Some((system_id, _)) = self.ctx.db.systems().latest_by_uid(system_uid)? else {
            return Err(HubError::integrity(format!(
                "no system with uid '{system_uid}'"
            )));
        };
        let revisions = self
            .ctx
            .db
            .command_streams()
            .revision_ids_for_control(system_id, control);
        if revisions.is_empty() {
            return Err(HubError::integrity(format!(
                "system '{system_uid}' has no control '{control}'"
            )));
        }
        for revision in revisions {
            self.ctx.db.command_streams().remove(revision)?;
        }

        let uid = stream_uid(system_uid, control);
        self.ctx.status.remove(&uid);
        let chain = self.ctx.ancestor_uids(Some(system_id))?;
        self.ctx
            .publish(EventKind::Removed, ResourceKind::CommandStream, &uid, &chain);
        Ok(())
    }
}

/// Mutations over features of interest.
#[derive(Debug, Clone)]
pub struct FoiHandler {
    ctx: HandlerCtx,
}

impl FoiHandler {
    /// Register or revise a feature by uid. An attached parent system must
    /// exist.
    pub fn add_or_update(&self, info: FoiInfo) -> HubResult<(FoiId, UpdateOutcome)> {
        if let Some(parent) = info.parent_system {
            if self.ctx.db.systems().get(parent)?.is_none() {
                return Err(HubError::integrity(format!(
                    "parent system {parent} does not exist"
                )));
            }
        }
        let uid = info.uid.clone();
        let parent = info.parent_system;
        let (id, outcome) = self.ctx.db.fois().add_or_update(info)?;
        let kind = match outcome {
            UpdateOutcome::Added => Some(EventKind::Added),
            UpdateOutcome::Replaced | UpdateOutcome::NewRevision => Some(EventKind::Changed),
            UpdateOutcome::Unchanged => None,
        };
        if let Some(kind) = kind {
            let chain = self.ctx.ancestor_uids(parent)?;
            self.ctx.publish(kind, ResourceKind::Foi, &uid, &chain);
        }
        Ok((id, outcome))
    }

    /// Delete a feature and all its revisions by uid.
    ///
    /// Without `cascade`, observations recorded against the feature refuse
    /// the delete; with `cascade` they are removed first.
    pub fn delete(&self, uid: &str, cascade: bool) -> HubResult<()> {
        let Some((_, info)) = self.ctx.db.fois().latest_by_uid(uid)? else {
            return Err(HubError::integrity(format!("no feature with uid '{uid}'")));
        };
        let revisions = self.ctx.db.fois().revision_ids(uid);
        let obs_filter =
            ObsFilter::all().with_fois(FoiFilter::all().with_internal_ids(revisions.clone()));
        let recorded = self.ctx.db.count_observations(&obs_filter)?;
        if recorded > 0 {
            if !cascade {
                return Err(HubError::integrity(format!(
                    "feature '{uid}' still has {recorded} observations; delete with cascade"
                )));
            }
            self.ctx.db.remove_observations(&obs_filter)?;
        }
        for revision in revisions {
            self.ctx.db.fois().remove(revision)?;
        }

        let chain = self.ctx.ancestor_uids(info.parent_system)?;
        self.ctx.publish(EventKind::Removed, ResourceKind::Foi, uid, &chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::events::{entity_topic, members_topic, registry_topic};
    use crate::time::Time;
    use crate::types::Observation;
    use serde_json::json;

    fn setup() -> (Arc<LocalDatabase>, EventBus, DatabaseHandlers) {
        let db = Arc::new(LocalDatabase::new(HubConfig::default()));
        let events = EventBus::new(32);
        let handlers = DatabaseHandlers::new(db.clone(), events.clone());
        (db, events, handlers)
    }

    fn schema(name: &str) -> serde_json::Value {
        json!({"name": name, "fields": {"value": {"type": "Quantity"}}})
    }

    #[test]
    fn test_add_publishes_through_hierarchy() {
        let (_, events, handlers) = setup();
        let mut registry = events.subscribe(&registry_topic(ResourceKind::System));
        let mut entity = events.subscribe(&entity_topic(ResourceKind::System, "urn:x:child"));
        let mut parent_members = events.subscribe(&members_topic("urn:x:root"));

        let (root, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:root"))
            .unwrap();
        handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:child").with_parent(root))
            .unwrap();

        // Registry saw both adds; entity and member topics saw the child.
        assert_eq!(registry.try_recv().unwrap().uid, "urn:x:root");
        let child_event = registry.try_recv().unwrap();
        assert_eq!(child_event.uid, "urn:x:child");
        assert_eq!(child_event.parent_uid.as_deref(), Some("urn:x:root"));
        assert_eq!(entity.try_recv().unwrap().kind, EventKind::Added);
        assert_eq!(parent_members.try_recv().unwrap().uid, "urn:x:child");
    }

    #[test]
    fn test_unchanged_update_publishes_nothing() {
        let (_, events, handlers) = setup();
        let info = SystemInfo::new("urn:x:s1").with_valid_start(Time::from_seconds(1));
        handlers.systems().add_or_update(info.clone()).unwrap();

        let mut registry = events.subscribe(&registry_topic(ResourceKind::System));
        let (_, outcome) = handlers.systems().add_or_update(info).unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert!(registry.try_recv().is_err());
    }

    #[test]
    fn test_guarded_delete_refuses_dependents() {
        let (_, _, handlers) = setup();
        let (sys, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();
        handlers
            .datastreams()
            .add_or_update(DataStreamInfo::new(sys, "temp").with_schema(schema("temp")))
            .unwrap();

        assert!(matches!(
            handlers.systems().delete("urn:x:s1", false),
            Err(HubError::Integrity { .. })
        ));
    }

    #[test]
    fn test_cascade_delete_removes_subtree_single_event() {
        let (db, events, handlers) = setup();
        let (root, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:root"))
            .unwrap();
        let (child, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:child").with_parent(root))
            .unwrap();
        let (ds, _) = handlers
            .datastreams()
            .add_or_update(DataStreamInfo::new(child, "temp").with_schema(schema("temp")))
            .unwrap();
        db.add_observation(Observation::new(ds, Time::from_seconds(1), json!(1)))
            .unwrap();
        handlers
            .fois()
            .add_or_update(FoiInfo::new("urn:x:roof").with_parent_system(child))
            .unwrap();

        let mut registry = events.subscribe(&registry_topic(ResourceKind::System));
        handlers.systems().delete("urn:x:root", true).unwrap();

        // Everything under the root is gone.
        assert!(db.systems().latest_by_uid("urn:x:root").unwrap().is_none());
        assert!(db.systems().latest_by_uid("urn:x:child").unwrap().is_none());
        assert!(db.datastreams().get(ds).unwrap().is_none());
        assert!(db.fois().latest_by_uid("urn:x:roof").unwrap().is_none());
        assert_eq!(db.count_observations(&ObsFilter::all()).unwrap(), 0);

        // One Removed event, for the resource the caller named.
        let event = registry.try_recv().unwrap();
        assert_eq!((event.kind, event.uid.as_str()), (EventKind::Removed, "urn:x:root"));
        assert!(registry.try_recv().is_err());
    }

    #[test]
    fn test_datastream_delete_guards_observations() {
        let (db, _, handlers) = setup();
        let (sys, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();
        let (ds, _) = handlers
            .datastreams()
            .add_or_update(DataStreamInfo::new(sys, "temp").with_schema(schema("temp")))
            .unwrap();
        db.add_observation(Observation::new(ds, Time::from_seconds(1), json!(1)))
            .unwrap();

        assert!(matches!(
            handlers.datastreams().delete("urn:x:s1", "temp", false),
            Err(HubError::Integrity { .. })
        ));
        handlers.datastreams().delete("urn:x:s1", "temp", true).unwrap();
        assert!(db.datastreams().get(ds).unwrap().is_none());
        assert_eq!(db.count_observations(&ObsFilter::all()).unwrap(), 0);
    }

    #[test]
    fn test_foi_delete_guards_observations() {
        let (db, _, handlers) = setup();
        let (sys, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();
        let (ds, _) = handlers
            .datastreams()
            .add_or_update(DataStreamInfo::new(sys, "temp").with_schema(schema("temp")))
            .unwrap();
        let (foi, _) = handlers
            .fois()
            .add_or_update(FoiInfo::new("urn:x:river"))
            .unwrap();
        db.add_observation(
            Observation::new(ds, Time::from_seconds(1), json!(1)).with_foi(foi),
        )
        .unwrap();
        db.add_observation(Observation::new(ds, Time::from_seconds(2), json!(2)))
            .unwrap();

        assert!(matches!(
            handlers.fois().delete("urn:x:river", false),
            Err(HubError::Integrity { .. })
        ));
        handlers.fois().delete("urn:x:river", true).unwrap();
        // Only the feature's observation went with it.
        assert_eq!(db.count_observations(&ObsFilter::all()).unwrap(), 1);
    }

    #[test]
    fn test_enable_disable_round_trip() {
        let (_, events, handlers) = setup();
        let (sys, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();
        handlers
            .datastreams()
            .add_or_update(DataStreamInfo::new(sys, "temp").with_schema(schema("temp")))
            .unwrap();

        let mut registry = events.subscribe(&registry_topic(ResourceKind::DataStream));
        assert!(handlers.datastreams().is_enabled("urn:x:s1", "temp"));
        handlers.datastreams().disable("urn:x:s1", "temp").unwrap();
        assert!(!handlers.datastreams().is_enabled("urn:x:s1", "temp"));
        assert_eq!(registry.try_recv().unwrap().kind, EventKind::Disabled);
        handlers.datastreams().enable("urn:x:s1", "temp").unwrap();
        assert!(handlers.datastreams().is_enabled("urn:x:s1", "temp"));
        assert_eq!(registry.try_recv().unwrap().kind, EventKind::Enabled);
    }

    #[test]
    fn test_unknown_parent_refused() {
        let (_, _, handlers) = setup();
        assert!(matches!(
            handlers
                .systems()
                .add_or_update(SystemInfo::new("urn:x:s1").with_parent(SystemId(42))),
            Err(HubError::Integrity { .. })
        ));
        assert!(matches!(
            handlers
                .datastreams()
                .add_or_update(DataStreamInfo::new(SystemId(42), "temp")),
            Err(HubError::Integrity { .. })
        ));
    }

    #[test]
    fn test_command_stream_lifecycle() {
        let (db, events, handlers) = setup();
        let (sys, _) = handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();
        let mut registry = events.subscribe(&registry_topic(ResourceKind::CommandStream));

        let (cs, outcome) = handlers
            .command_streams()
            .add_or_update(CommandStreamInfo::new(sys, "setpoint").with_schema(schema("setpoint")))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Added);
        assert_eq!(registry.try_recv().unwrap().uid, "urn:x:s1/setpoint");

        handlers.command_streams().delete("urn:x:s1", "setpoint").unwrap();
        assert!(db.command_streams().get(cs).unwrap().is_none());
        assert_eq!(registry.try_recv().unwrap().kind, EventKind::Removed);
    }
}
