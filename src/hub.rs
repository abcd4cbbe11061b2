/// The hub facade: databases, handlers, federation and events in one place.
///
/// A [`SensorHub`] owns one event bus and one federation. Registering a
/// database number creates a fresh [`LocalDatabase`] with the hub's
/// configuration, wires its [`DatabaseHandlers`] to the shared bus, and adds
/// it to the federation, so federated queries and event subscriptions work
/// immediately. The hub clones cheaply; every part of it is shared.
use crate::config::HubConfig;
use crate::database::LocalDatabase;
use crate::error::{HubError, HubResult};
use crate::events::EventBus;
use crate::federation::{DbNum, FederatedDatabase};
use crate::transactions::DatabaseHandlers;
use dashmap::DashMap;
use std::sync::Arc;

/// Entry point tying the whole engine together.
///
/// # Example
///
/// ```ignore
/// use sensorhub::{SensorHub, SystemInfo, ObsFilter};
///
/// let hub = SensorHub::with_defaults();
/// let db = hub.register_database(1)?;
/// let handlers = hub.handlers(1).unwrap();
///
/// handlers.systems().add_or_update(SystemInfo::new("urn:x:station1"))?;
/// for (key, obs) in hub.federation().select_observations(&ObsFilter::all())? {
///     println!("{key}: {:?}", obs.result);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct SensorHub {
    config: HubConfig,
    events: EventBus,
    federation: FederatedDatabase,
    handlers: Arc<DashMap<DbNum, DatabaseHandlers>>,
}

impl SensorHub {
    /// Create a hub with the given configuration.
    pub fn new(config: HubConfig) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        Self {
            config,
            events,
            federation: FederatedDatabase::new(),
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Create a hub with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// The hub's configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create and register an empty database under `db`, returning its
    /// handle. Fails when the number is taken.
    pub fn register_database(&self, db: DbNum) -> HubResult<Arc<LocalDatabase>> {
        let database = Arc::new(LocalDatabase::new(self.config.clone()));
        self.register_existing(db, database.clone())?;
        Ok(database)
    }

    /// Register an already-populated database under `db`.
    pub fn register_existing(&self, db: DbNum, database: Arc<LocalDatabase>) -> HubResult<()> {
        self.federation.register(db, database.clone())?;
        self.handlers
            .insert(db, DatabaseHandlers::new(database, self.events.clone()));
        Ok(())
    }

    /// Remove a database from the hub, returning its handle.
    pub fn unregister_database(&self, db: DbNum) -> Option<Arc<LocalDatabase>> {
        self.handlers.remove(&db);
        self.federation.unregister(db)
    }

    /// One registered database.
    pub fn database(&self, db: DbNum) -> Option<Arc<LocalDatabase>> {
        self.federation.member(db)
    }

    /// The transaction handlers of one registered database.
    pub fn handlers(&self, db: DbNum) -> Option<DatabaseHandlers> {
        self.handlers.get(&db).map(|entry| entry.clone())
    }

    /// The federated read surface over every registered database.
    pub fn federation(&self) -> &FederatedDatabase {
        &self.federation
    }

    /// The transaction handlers of one registered database, or an error
    /// naming the missing number.
    pub fn require_handlers(&self, db: DbNum) -> HubResult<DatabaseHandlers> {
        self.handlers(db)
            .ok_or_else(|| HubError::validation(format!("no database registered under {db}")))
    }

    /// The shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Default for SensorHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, ResourceKind, registry_topic};
    use crate::filter::SystemFilter;
    use crate::types::SystemInfo;

    #[test]
    fn test_register_and_query_through_federation() {
        let hub = SensorHub::with_defaults();
        hub.register_database(1).unwrap();
        hub.register_database(2).unwrap();

        let handlers = hub.require_handlers(1).unwrap();
        handlers
            .systems()
            .add_or_update(SystemInfo::new("urn:x:s1"))
            .unwrap();

        let systems = hub.federation().select_systems(&SystemFilter::all()).unwrap();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].1.uid, "urn:x:s1");
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let hub = SensorHub::with_defaults();
        hub.register_database(1).unwrap();
        assert!(hub.register_database(1).is_err());
        assert!(hub.require_handlers(9).is_err());
    }

    #[test]
    fn test_handlers_share_the_hub_bus() {
        let hub = SensorHub::with_defaults();
        hub.register_database(1).unwrap();
        hub.register_database(2).unwrap();
        let mut registry = hub.events().subscribe(&registry_topic(ResourceKind::System));

        for db in [1, 2] {
            hub.require_handlers(db)
                .unwrap()
                .systems()
                .add_or_update(SystemInfo::new(format!("urn:x:s{db}")))
                .unwrap();
        }
        assert_eq!(registry.try_recv().unwrap().kind, EventKind::Added);
        assert_eq!(registry.try_recv().unwrap().uid, "urn:x:s2");
    }

    #[test]
    fn test_unregister_removes_from_federation() {
        let hub = SensorHub::with_defaults();
        hub.register_database(1).unwrap();
        assert!(hub.unregister_database(1).is_some());
        assert!(hub.database(1).is_none());
        assert!(hub.federation().is_empty());
    }
}
