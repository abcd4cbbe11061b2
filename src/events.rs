/// Hierarchical resource lifecycle events.
///
/// Transaction handlers publish an event after every successful mutation.
/// Topics form a hierarchy: subscribers can watch one entity
/// (`system/<uid>`), the member subtree of a group (`system/<uid>/members`),
/// or a whole resource registry (`registry/systems`). One mutation fans out
/// to the entity topic first, then each ancestor's member topic from nearest
/// to root, then the registry topic, so a subscriber holding both an entity
/// and a registry subscription sees the entity delivery first.
///
/// Delivery is best-effort broadcast: a topic with no subscribers drops the
/// event, and a slow subscriber that overflows its channel loses the oldest
/// events (`tokio`'s broadcast lag semantics). Events are notifications, not
/// a replication log.
use crate::time::Time;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The resource was created.
    Added,
    /// The resource's description changed (any revision outcome except a
    /// no-op).
    Changed,
    /// The resource was deleted, after any cascade completed.
    Removed,
    /// The resource was switched to receiving data.
    Enabled,
    /// The resource was switched away from receiving data.
    Disabled,
}

/// Which kind of resource the event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A system (sensor, process, platform).
    System,
    /// A datastream revision.
    DataStream,
    /// A command stream revision.
    CommandStream,
    /// A feature of interest.
    Foi,
}

impl ResourceKind {
    /// Registry topic segment for this kind.
    fn registry_segment(self) -> &'static str {
        match self {
            Self::System => "systems",
            Self::DataStream => "datastreams",
            Self::CommandStream => "commandstreams",
            Self::Foi => "fois",
        }
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    /// What happened.
    pub kind: EventKind,
    /// What kind of resource.
    pub resource: ResourceKind,
    /// The stable unique id of the affected resource. Datastreams and
    /// command streams carry their owning system's uid plus the output or
    /// control name.
    pub uid: String,
    /// The owning system's uid, when the resource has one.
    pub parent_uid: Option<String>,
    /// When the mutation committed.
    pub time: Time,
}

impl HubEvent {
    /// Create an event stamped now.
    pub fn new(kind: EventKind, resource: ResourceKind, uid: impl Into<String>) -> Self {
        Self {
            kind,
            resource,
            uid: uid.into(),
            parent_uid: None,
            time: Time::now(),
        }
    }

    /// Attach the owning system's uid.
    pub fn with_parent(mut self, parent_uid: impl Into<String>) -> Self {
        self.parent_uid = Some(parent_uid.into());
        self
    }
}

/// Topic for one entity's own events.
pub fn entity_topic(resource: ResourceKind, uid: &str) -> String {
    match resource {
        ResourceKind::System => format!("system/{uid}"),
        ResourceKind::DataStream => format!("datastream/{uid}"),
        ResourceKind::CommandStream => format!("commandstream/{uid}"),
        ResourceKind::Foi => format!("foi/{uid}"),
    }
}

/// Topic carrying events for everything inside a system's subtree.
pub fn members_topic(system_uid: &str) -> String {
    format!("system/{system_uid}/members")
}

/// Topic carrying every event for one resource kind.
pub fn registry_topic(resource: ResourceKind) -> String {
    format!("registry/{}", resource.registry_segment())
}

/// Cheap-to-clone publish/subscribe hub keyed by topic string.
///
/// Channels are created lazily on first subscription; publishing to a topic
/// nobody watches is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    channels: Arc<DashMap<String, broadcast::Sender<HubEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose per-topic channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to one topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<HubEvent> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to one topic. Dropped silently when nobody subscribed.
    pub fn publish(&self, topic: &str, event: HubEvent) {
        if let Some(sender) = self.channels.get(topic) {
            // send fails only when all receivers are gone.
            let _ = sender.send(event);
        }
    }

    /// Publish one event through the topic hierarchy: the entity topic, then
    /// each ancestor's member topic (nearest first), then the registry topic.
    pub fn publish_hierarchy<'a>(
        &self,
        event: HubEvent,
        ancestor_uids: impl IntoIterator<Item = &'a str>,
    ) {
        self.publish(&entity_topic(event.resource, &event.uid), event.clone());
        if let Some(parent) = &event.parent_uid {
            self.publish(&members_topic(parent), event.clone());
        }
        for ancestor in ancestor_uids {
            self.publish(&members_topic(ancestor), event.clone());
        }
        self.publish(&registry_topic(event.resource), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        bus.publish(
            "registry/systems",
            HubEvent::new(EventKind::Added, ResourceKind::System, "urn:x:s1"),
        );
        // No channel was created just to drop the event.
        assert!(bus.channels.is_empty());
    }

    #[test]
    fn test_subscribe_then_publish_delivers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(&registry_topic(ResourceKind::System));
        let event = HubEvent::new(EventKind::Added, ResourceKind::System, "urn:x:s1");
        bus.publish_hierarchy(event.clone(), []);
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn test_hierarchy_reaches_ancestor_members_topics() {
        let bus = EventBus::new(8);
        let mut entity = bus.subscribe(&entity_topic(ResourceKind::DataStream, "urn:x:s2/temp"));
        let mut parent = bus.subscribe(&members_topic("urn:x:s2"));
        let mut grandparent = bus.subscribe(&members_topic("urn:x:root"));
        let mut registry = bus.subscribe(&registry_topic(ResourceKind::DataStream));
        let mut unrelated = bus.subscribe(&members_topic("urn:x:other"));

        let event = HubEvent::new(EventKind::Added, ResourceKind::DataStream, "urn:x:s2/temp")
            .with_parent("urn:x:s2");
        bus.publish_hierarchy(event.clone(), ["urn:x:root"]);

        assert_eq!(entity.try_recv().unwrap(), event);
        assert_eq!(parent.try_recv().unwrap(), event);
        assert_eq!(grandparent.try_recv().unwrap(), event);
        assert_eq!(registry.try_recv().unwrap(), event);
        assert!(unrelated.try_recv().is_err());
    }

    #[test]
    fn test_clone_shares_channels() {
        let bus = EventBus::new(8);
        let clone = bus.clone();
        let mut rx = bus.subscribe("registry/fois");
        clone.publish(
            "registry/fois",
            HubEvent::new(EventKind::Removed, ResourceKind::Foi, "urn:x:f1"),
        );
        assert!(rx.try_recv().is_ok());
    }
}
