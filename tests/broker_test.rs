//! Tests for entity brokers: identity, persistence, reclamation, streams.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use common::{
    CATEGORIES, CATEGORY, CHANNELS, CategoryChannel, Channel, ChannelModel, ChannelPatch, Guild,
    GuildActor, InstrumentedProvider, TEXT, THREAD, TestClient, VOICE, categories_key, channel,
    channels_key, controller, controller_with, controller_with_channels, guild, guild_path,
};
use muninn::store::Direction;
use muninn::{CachePath, LatentSlot, MuninnError, StateConfig};

// ============================================================================
// Identity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_construct_once() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = CachePath::new();
    state.update::<Guild>(guild(1, "muninn"), &path).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let state = state.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            state.get::<Guild>(&path, 1, None).await.unwrap().unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    assert_eq!(client.constructions(), 1);
    assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_construct_once() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            state
                .create::<Guild>(guild(2, "hugin"), &CachePath::new(), None)
                .await
                .unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    assert_eq!(client.constructions(), 1);
    assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
}

#[tokio::test]
async fn create_does_not_persist() {
    let state = controller(TestClient::new());
    let path = CachePath::new();
    let _handle = state.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();

    let broker = state.broker::<Guild>().unwrap();
    let stored = broker.store_info(&path).unwrap().store().await.unwrap().get(&1).await.unwrap();
    assert!(stored.is_none());
    assert!(broker.is_cached(&1));
}

#[tokio::test]
async fn get_of_unknown_id_is_none() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let found = state.get::<Guild>(&CachePath::new(), 404, None).await.unwrap();
    assert!(found.is_none());
    assert_eq!(client.constructions(), 0);
}

#[tokio::test]
async fn actor_reaches_the_constructor() {
    let state = controller(TestClient::new());
    let path = CachePath::new();
    state.update::<Guild>(guild(1, "a"), &path).await.unwrap();

    let actor = Arc::new(GuildActor {
        tag: "rest".to_owned(),
    });
    let handle = state.get::<Guild>(&path, 1, Some(actor)).await.unwrap().unwrap();
    assert_eq!(handle.actor_tag.as_deref(), Some("rest"));
}

#[tokio::test]
async fn failed_construction_registers_nothing() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = guild_path(1);

    let err = state
        .create::<dyn Channel>(channel(5, TEXT, "poison"), &path, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MuninnError::Construction(_)));

    let broker = state.broker::<dyn Channel>().unwrap();
    assert!(!broker.is_cached(&5));

    // the id lock was released
    let handle = state
        .create::<dyn Channel>(channel(5, TEXT, "general"), &path, None)
        .await
        .unwrap();
    assert_eq!(handle.name(), "general");
    assert_eq!(client.constructions(), 1);
}

#[tokio::test]
async fn unowned_kind_is_rejected() {
    let state = controller(TestClient::new());
    let err = state
        .create::<dyn Channel>(channel(9, THREAD, "thread"), &guild_path(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MuninnError::NotOwned { broker: "Channel", .. }));
    assert!(err.is_invariant_violation());
}

// ============================================================================
// Updates
// ============================================================================

#[tokio::test]
async fn update_writes_through_and_merges() {
    let state = controller(TestClient::new());
    let path = CachePath::new();
    let handle = state.create::<Guild>(guild(1, "before"), &path, None).await.unwrap();

    state.update::<Guild>(guild(1, "after"), &path).await.unwrap();

    assert_eq!(*handle.name.read(), "after");
    let broker = state.broker::<Guild>().unwrap();
    let stored = broker.store_info(&path).unwrap().get(&1).await.unwrap();
    assert_eq!(stored, Some(guild(1, "after")));
}

#[tokio::test]
async fn update_without_live_entity_only_persists() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = CachePath::new();

    state.update::<Guild>(guild(3, "stored"), &path).await.unwrap();
    assert_eq!(client.constructions(), 0);

    let handle = state.get::<Guild>(&path, 3, None).await.unwrap().unwrap();
    assert_eq!(*handle.name.read(), "stored");
}

#[tokio::test(start_paused = true)]
async fn update_racing_a_slow_construction_keeps_the_newer_model() {
    let provider = Arc::new(
        InstrumentedProvider::<ChannelModel>::new().delay(CHANNELS, Duration::from_millis(200)),
    );
    provider.seed(&channels_key(1), channel(10, TEXT, "v1")).await;
    let client = TestClient::new();
    let state = controller_with_channels(
        Arc::clone(&client),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);

    // holds the id lock while it reads "v1"
    let read = {
        let state = state.clone();
        let path = path.clone();
        tokio::spawn(async move { state.get::<dyn Channel>(&path, 10, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    state
        .update::<dyn Channel>(channel(10, TEXT, "v2"), &path)
        .await
        .unwrap();

    let handle = read.await.unwrap().unwrap().unwrap();
    assert_eq!(handle.name(), "v2");
    assert_eq!(
        provider.stored(&channels_key(1), &10).await.map(|m| m.name),
        Some("v2".to_owned())
    );
    assert_eq!(client.constructions(), 1);
}

#[tokio::test(start_paused = true)]
async fn routed_update_waits_for_the_sub_broker_lock() {
    let provider = Arc::new(
        InstrumentedProvider::<ChannelModel>::new().delay(CATEGORIES, Duration::from_millis(200)),
    );
    provider.seed(&categories_key(1), channel(20, CATEGORY, "v1")).await;
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);

    let read = {
        let state = state.clone();
        let path = path.clone();
        tokio::spawn(async move { state.get::<CategoryChannel>(&path, 20, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    state
        .update::<dyn Channel>(channel(20, CATEGORY, "v2"), &path)
        .await
        .unwrap();

    let handle = read.await.unwrap().unwrap().unwrap();
    assert_eq!(handle.name(), "v2");
    assert_eq!(
        provider.stored(&categories_key(1), &20).await.map(|m| m.name),
        Some("v2".to_owned())
    );
}

#[tokio::test]
async fn partial_update_applies_to_the_live_entity() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    let handle = state
        .create::<dyn Channel>(channel(10, TEXT, "general"), &path, None)
        .await
        .unwrap();

    let patch = ChannelPatch {
        id: Some(10),
        name: Some("lobby".to_owned()),
        position: None,
    };
    assert!(state.update_partial::<dyn Channel, _>(&patch, &path).await.unwrap());

    assert_eq!(handle.name(), "lobby");
    let stored = provider.stored(&channels_key(1), &10).await.unwrap();
    assert_eq!(stored.name, "lobby");
}

#[tokio::test]
async fn partial_update_uses_the_stored_model_as_base() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    provider
        .seed(&channels_key(1), channel(11, VOICE, "stage"))
        .await;

    let patch = ChannelPatch {
        id: Some(11),
        position: Some(4),
        ..Default::default()
    };
    assert!(state.update_partial::<dyn Channel, _>(&patch, &path).await.unwrap());

    let stored = provider.stored(&channels_key(1), &11).await.unwrap();
    assert_eq!(stored.position, 4);
    assert_eq!(stored.name, "stage");
}

#[tokio::test]
async fn partial_update_without_id_or_change_is_skipped() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    provider
        .seed(&channels_key(1), channel(12, TEXT, "same"))
        .await;

    let anonymous = ChannelPatch {
        name: Some("x".to_owned()),
        ..Default::default()
    };
    assert!(!state.update_partial::<dyn Channel, _>(&anonymous, &path).await.unwrap());

    let unchanged = ChannelPatch {
        id: Some(12),
        name: Some("same".to_owned()),
        ..Default::default()
    };
    assert!(!state.update_partial::<dyn Channel, _>(&unchanged, &path).await.unwrap());

    let unknown = ChannelPatch {
        id: Some(77),
        name: Some("ghost".to_owned()),
        ..Default::default()
    };
    assert!(!state.update_partial::<dyn Channel, _>(&unknown, &path).await.unwrap());
    assert!(provider.stored(&channels_key(1), &77).await.is_none());
}

#[tokio::test]
async fn batch_create_or_update_keeps_input_order() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let client = TestClient::new();
    let state = controller_with_channels(
        Arc::clone(&client),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    let existing = state
        .create::<dyn Channel>(channel(2, TEXT, "old"), &path, None)
        .await
        .unwrap();

    let handles = state
        .batch_create_or_update::<dyn Channel>(
            vec![
                channel(3, VOICE, "c"),
                channel(1, TEXT, "a"),
                channel(20, CATEGORY, "group"),
                channel(2, TEXT, "new"),
            ],
            &path,
            true,
        )
        .await
        .unwrap();

    let ids: Vec<u64> = handles.iter().map(|h| *h.id()).collect();
    assert_eq!(ids, vec![3, 1, 20, 2]);
    assert!(handles[3].ptr_eq(&existing));
    assert_eq!(existing.name(), "new");
    assert_eq!(client.constructions(), 4);

    assert!(provider.stored(&channels_key(1), &3).await.is_some());
    assert!(provider.stored(&categories_key(1), &20).await.is_some());
    assert!(provider.stored(&channels_key(1), &20).await.is_none());
}

#[tokio::test]
async fn batch_update_routes_each_kind_to_its_store() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    let live = state
        .create::<dyn Channel>(channel(1, TEXT, "a"), &path, None)
        .await
        .unwrap();

    state
        .batch_update::<dyn Channel>(
            vec![channel(1, TEXT, "a2"), channel(21, CATEGORY, "group")],
            &path,
        )
        .await
        .unwrap();

    assert_eq!(live.name(), "a2");
    assert!(provider.stored(&channels_key(1), &1).await.is_some());
    assert!(provider.stored(&categories_key(1), &21).await.is_some());
}

// ============================================================================
// Handles and reclamation
// ============================================================================

#[tokio::test]
async fn dropping_the_last_handle_reclaims_the_reference() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = CachePath::new();
    let broker = state.broker::<Guild>().unwrap();

    let handle = state.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    assert_eq!(broker.reference_count(), 1);
    drop(handle);

    state.flush().await.unwrap();
    assert_eq!(broker.reference_count(), 0);
    assert!(!broker.is_cached(&1));

    let _again = state.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    assert_eq!(client.constructions(), 2);
}

#[tokio::test]
async fn external_arc_keeps_the_entity_addressable() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = CachePath::new();
    let broker = state.broker::<Guild>().unwrap();

    let handle = state.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    let entity = Arc::clone(handle.entity());
    drop(handle);
    state.flush().await.unwrap();

    assert!(broker.is_cached(&1));
    let again = state.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    assert!(again.is(&entity));
    assert_eq!(client.constructions(), 1);

    drop(again);
    drop(entity);
    state.flush().await.unwrap();
    assert_eq!(broker.sweep(), 1);
    assert_eq!(broker.reference_count(), 0);
}

#[tokio::test]
async fn handle_clones_are_counted() {
    let state = controller(TestClient::new());
    let broker = state.broker::<Guild>().unwrap();
    let handle = state
        .create::<Guild>(guild(1, "a"), &CachePath::new(), None)
        .await
        .unwrap();
    assert_eq!(broker.handle_count(&1), 1);

    let clone = handle.clone();
    assert_eq!(broker.handle_count(&1), 2);
    assert_ne!(clone.handle_id(), handle.handle_id());

    clone.release();
    assert_eq!(broker.handle_count(&1), 1);
}

#[tokio::test]
async fn foreign_handles_are_not_owned() {
    let ours = controller(TestClient::new());
    let theirs = controller(TestClient::new());
    let path = CachePath::new();

    let foreign = theirs.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    let _own = ours.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();

    let err = ours
        .broker::<Guild>()
        .unwrap()
        .release_handle(foreign)
        .unwrap_err();
    assert!(matches!(err, MuninnError::HandleNotOwned { entity: "Guild" }));

    let own = ours.create::<Guild>(guild(1, "a"), &path, None).await.unwrap();
    ours.broker::<Guild>().unwrap().release_handle(own).unwrap();
}

#[tokio::test(start_paused = true)]
async fn lock_timeout_bounds_waiting() {
    let state = controller_with(TestClient::new(), StateConfig::new().lock_timeout_ms(50));
    let path = CachePath::new();
    state.update::<Guild>(guild(1, "a"), &path).await.unwrap();

    let broker = state.broker::<Guild>().unwrap();
    let slot = broker.try_create_latent_handle(&guild(1, "a"));
    assert!(matches!(slot, LatentSlot::Miss(_)));

    let err = state.get::<Guild>(&path, 1, None).await.unwrap_err();
    assert!(matches!(err, MuninnError::LockTimeout { .. }));

    drop(slot);
    assert!(state.get::<Guild>(&path, 1, None).await.unwrap().is_some());
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn get_all_reuses_live_entities() {
    let client = TestClient::new();
    let state = controller(Arc::clone(&client));
    let path = CachePath::new();
    state
        .batch_update::<Guild>(vec![guild(1, "a"), guild(2, "b"), guild(3, "c")], &path)
        .await
        .unwrap();
    let live = state.get::<Guild>(&path, 2, None).await.unwrap().unwrap();

    let handles: Vec<_> = state
        .get_all::<Guild>(&path)
        .unwrap()
        .map(|h| h.unwrap())
        .collect()
        .await;

    assert_eq!(handles.len(), 3);
    let two = handles.iter().find(|h| *h.id() == 2).unwrap();
    assert!(two.ptr_eq(&live));
    assert_eq!(client.constructions(), 3);
}

#[tokio::test]
async fn query_pages_in_both_directions() {
    let state = controller(TestClient::new());
    let path = CachePath::new();
    state
        .batch_update::<Guild>((1..=10).map(|id| guild(id, "g")).collect(), &path)
        .await
        .unwrap();

    let after: Vec<u64> = state
        .query::<Guild>(&path, 3, None, Direction::After, Some(4))
        .unwrap()
        .map(|h| *h.unwrap().id())
        .collect()
        .await;
    assert_eq!(after, vec![3, 4, 5, 6]);

    let before: Vec<u64> = state
        .query::<Guild>(&path, 8, Some(5), Direction::Before, None)
        .unwrap()
        .map(|h| *h.unwrap().id())
        .collect()
        .await;
    assert_eq!(before, vec![8, 7, 6, 5]);
}

#[tokio::test]
async fn query_merges_across_stores() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let state = controller_with_channels(
        TestClient::new(),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    let path = guild_path(1);
    for (id, kind) in [(1, TEXT), (2, CATEGORY), (3, VOICE), (4, CATEGORY), (5, TEXT)] {
        let key = if kind == CATEGORY {
            categories_key(1)
        } else {
            channels_key(1)
        };
        provider.seed(&key, channel(id, kind, "c")).await;
    }

    let ids: Vec<u64> = state
        .query::<dyn Channel>(&path, 2, None, Direction::After, Some(3))
        .unwrap()
        .map(|h| *h.unwrap().id())
        .collect()
        .await;
    assert_eq!(ids, vec![2, 3, 4]);
}

#[tokio::test]
async fn get_all_ids_spans_the_hierarchy() {
    let provider = Arc::new(InstrumentedProvider::<ChannelModel>::new());
    let client = TestClient::new();
    let state = controller_with_channels(
        Arc::clone(&client),
        Arc::clone(&provider),
        StateConfig::default(),
    );
    provider.seed(&channels_key(1), channel(1, TEXT, "a")).await;
    provider.seed(&categories_key(1), channel(2, CATEGORY, "b")).await;

    let broker = state.broker::<dyn Channel>().unwrap();
    let mut ids: Vec<u64> = broker
        .get_all_ids(&guild_path(1))
        .map(|id| id.unwrap())
        .collect()
        .await;
    ids.sort();

    assert_eq!(ids, vec![1, 2]);
    assert_eq!(client.constructions(), 0);
}

#[tokio::test]
async fn stream_reports_path_errors() {
    let state = controller(TestClient::new());
    let results: Vec<_> = state
        .get_all::<dyn Channel>(&CachePath::new())
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        Err(MuninnError::MissingPathEntry { entity: "Guild" })
    ));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_stream_stops_the_producer() {
    let state = controller_with(TestClient::new(), StateConfig::new().stream_buffer(1));
    let path = CachePath::new();
    state
        .batch_update::<Guild>((1..=50).map(|id| guild(id, "g")).collect(), &path)
        .await
        .unwrap();

    let mut stream = state.get_all::<Guild>(&path).unwrap();
    let first = stream.next().await.unwrap().unwrap();
    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let broker = state.broker::<Guild>().unwrap();
    assert!(broker.is_cached(first.id()));
    assert!(broker.reference_count() < 50);
}
