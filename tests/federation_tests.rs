//! Federation tests: public-id translation, query dispatch and the merged
//! observation stream across multiple physical stores.

use sensorhub::SystemId;
use sensorhub::keys::split_public_id;
use sensorhub::prelude::*;
use std::collections::BTreeSet;

fn schema(name: &str) -> JsonValue {
    json!({"name": name, "fields": {"value": {"type": "Quantity"}}})
}

/// Two stores, three systems; two of the systems are weather-related.
fn two_store_hub() -> SensorHub {
    let hub = SensorHub::with_defaults();
    let a = hub.register_database(1).unwrap();
    let b = hub.register_database(2).unwrap();
    let ha = hub.require_handlers(1).unwrap();
    let hb = hub.require_handlers(2).unwrap();

    let (s1, _) = ha
        .systems()
        .add_or_update(SystemInfo::new("urn:osh:north").with_name("Weather station north"))
        .unwrap();
    ha.systems()
        .add_or_update(SystemInfo::new("urn:osh:cam").with_name("Traffic camera"))
        .unwrap();
    let (s3, _) = hb
        .systems()
        .add_or_update(SystemInfo::new("urn:osh:south").with_name("Weather buoy south"))
        .unwrap();

    let (ds1, _) = ha
        .datastreams()
        .add_or_update(DataStreamInfo::new(s1, "temp").with_schema(schema("temp")))
        .unwrap();
    let (ds3, _) = hb
        .datastreams()
        .add_or_update(DataStreamInfo::new(s3, "temp").with_schema(schema("temp")))
        .unwrap();

    for secs in [10, 40] {
        a.add_observation(Observation::new(ds1, Time::from_seconds(secs), json!("north")))
            .unwrap();
    }
    for secs in [20, 30, 50] {
        b.add_observation(Observation::new(ds3, Time::from_seconds(secs), json!("south")))
            .unwrap();
    }
    hub
}

#[test]
fn keyword_query_merges_across_stores_in_time_order() {
    let hub = two_store_hub();
    let filter = ObsFilter::all().with_datastreams(
        DataStreamFilter::all().with_systems(SystemFilter::all().with_keywords(["weather"])),
    );

    let hits: Vec<(FederatedObsKey, Observation)> = hub
        .federation()
        .select_observations(&filter)
        .unwrap()
        .collect();

    let times: Vec<i64> = hits
        .iter()
        .map(|(key, _)| key.local.phenomenon_time.seconds)
        .collect();
    assert_eq!(times, vec![10, 20, 30, 40, 50]);

    // Both stores contributed, and every key is globally unique.
    let dbs: BTreeSet<u8> = hits.iter().map(|(key, _)| key.db).collect();
    assert_eq!(dbs, BTreeSet::from([1, 2]));
    let unique: BTreeSet<FederatedObsKey> = hits.iter().map(|(key, _)| *key).collect();
    assert_eq!(unique.len(), hits.len());
}

#[test]
fn public_ids_are_collision_free_and_reversible() {
    let hub = two_store_hub();
    let systems = hub
        .federation()
        .select_systems(&SystemFilter::all())
        .unwrap();
    assert_eq!(systems.len(), 3);

    let ids: BTreeSet<u64> = systems.iter().map(|(id, _)| id.0).collect();
    assert_eq!(ids.len(), 3);
    // Every public id decodes to its owning store.
    for (id, info) in &systems {
        let (db, local) = split_public_id(id.0);
        let member = hub.database(db).unwrap();
        let (_, direct) = member
            .systems()
            .latest_by_uid(&info.uid)
            .unwrap()
            .unwrap();
        assert_eq!(direct.uid, info.uid);
        assert!(local >= 1);
    }
}

#[test]
fn explicit_public_id_dispatches_to_one_store() {
    let hub = two_store_hub();
    let systems = hub
        .federation()
        .select_systems(&SystemFilter::all())
        .unwrap();
    let (south_id, _) = systems
        .iter()
        .find(|(_, info)| info.uid == "urn:osh:south")
        .unwrap();

    let hits = hub
        .federation()
        .select_systems(&SystemFilter::all().with_internal_ids([*south_id]))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].1.uid, "urn:osh:south");
}

#[test]
fn datastream_results_carry_public_system_ids() {
    let hub = two_store_hub();
    let streams = hub
        .federation()
        .select_datastreams(&DataStreamFilter::all())
        .unwrap();
    assert_eq!(streams.len(), 2);
    for (id, info) in streams {
        // The stream and its owning system decode to the same store.
        assert_eq!(split_public_id(id.0).0, split_public_id(info.system.0).0);
    }
}

#[test]
fn observation_lookup_by_public_key() {
    let hub = two_store_hub();
    let (key, obs) = hub
        .federation()
        .select_observations(&ObsFilter::all())
        .unwrap()
        .next()
        .unwrap();

    let back = hub.federation().get_observation(&key).unwrap().unwrap();
    assert_eq!(back, obs);

    // The public byte form round-trips.
    assert_eq!(FederatedObsKey::decode(&key.encode()), Some(key));

    // Unknown store numbers resolve to nothing.
    let mut stranger = key;
    stranger.db = 99;
    assert!(hub.federation().get_observation(&stranger).unwrap().is_none());
}

#[test]
fn top_level_sentinel_broadcasts_to_all_stores() {
    let hub = two_store_hub();
    // All three systems are top-level; the sentinel cannot be attributed to
    // any single store, so every member answers.
    let hits = hub
        .federation()
        .select_systems(&SystemFilter::all().with_parents([SystemId::NO_PARENT]))
        .unwrap();
    assert_eq!(hits.len(), 3);
}

#[test]
fn global_limit_truncates_the_merged_stream() {
    let hub = two_store_hub();
    let times: Vec<i64> = hub
        .federation()
        .select_observations(&ObsFilter::all().with_limit(3))
        .unwrap()
        .map(|(key, _)| key.local.phenomenon_time.seconds)
        .collect();
    assert_eq!(times, vec![10, 20, 30]);
}

#[test]
fn unregistering_a_store_removes_its_results() {
    let hub = two_store_hub();
    hub.unregister_database(2).unwrap();

    let times: Vec<i64> = hub
        .federation()
        .select_observations(&ObsFilter::all())
        .unwrap()
        .map(|(key, _)| key.local.phenomenon_time.seconds)
        .collect();
    assert_eq!(times, vec![10, 40]);
}

#[test]
fn events_flow_from_every_registered_store() {
    let hub = SensorHub::with_defaults();
    hub.register_database(1).unwrap();
    hub.register_database(2).unwrap();
    let mut registry = hub
        .events()
        .subscribe(&sensorhub::events::registry_topic(ResourceKind::System));

    for db in [1u8, 2] {
        hub.require_handlers(db)
            .unwrap()
            .systems()
            .add_or_update(SystemInfo::new(format!("urn:osh:s{db}")))
            .unwrap();
    }

    let uids: Vec<String> = std::iter::from_fn(|| registry.try_recv().ok())
        .map(|event| event.uid)
        .collect();
    assert_eq!(uids, vec!["urn:osh:s1", "urn:osh:s2"]);
}
