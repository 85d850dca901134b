//! Integration tests for the full mutation pipeline.
//!
//! Tests: Command → Mutator → Storage → Publisher → Bus → EventSink → Mutator
//!
//! Verifies:
//! - Commands produce persisted, published events and correct replies
//! - Routing errors and rejections leave no trace in storage or on the bus
//! - Optimistic concurrency conflicts are detected
//! - Publish failures are compensated through the outbox
//! - Events cascade into other streams through the bus

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use tidewater_core::{DomainError, PayloadError, StreamId};
    use tidewater_events::{
        BusConfig, Command, Context, Event, EventHandler, PartitionedBus, Projection, Reply, State,
        Stream,
    };

    use crate::config::{EngineConfig, RelayConfig};
    use crate::controller::{Pick, command_fn, event_fn};
    use crate::mutator::{CommandSink, EventSink, MutationError, Mutator};
    use crate::relay::OutboxRelay;
    use crate::sink_handler::SinkHandler;
    use crate::storage::{InMemoryStorage, Outbox, Storage, StorageError};
    use crate::test_support::{Membership, SpyPublisher, SpyStorage, UserJoined, joined};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Order {
        total: u32,
        placed: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Placed {
        total: u32,
    }

    impl State for Order {
        fn apply(&mut self, event: &Event) -> Result<(), PayloadError> {
            match event.name() {
                "placed" => {
                    let placed: Placed = event.decode()?;
                    self.total = placed.total;
                    self.placed = true;
                    Ok(())
                }
                other => Err(PayloadError::unexpected(other)),
            }
        }
    }

    fn place_order(
        stream: &mut Stream<Order>,
        command: &Command,
    ) -> Result<Option<Reply>, DomainError> {
        let placed: Placed = command.decode()?;
        if placed.total == 0 {
            return Err(DomainError::validation("total must be positive"));
        }
        if stream.state().placed {
            return Err(DomainError::invariant("order already placed"));
        }
        stream.mutate("placed", &placed)?;
        Ok(None)
    }

    fn order_engine(
        storage: SpyStorage<Order>,
        publisher: SpyPublisher,
    ) -> Mutator<Order, SpyStorage<Order>, SpyPublisher> {
        Mutator::builder(storage, publisher)
            .command_create("place", command_fn(place_order))
            .command(
                "touch",
                command_fn(|_: &mut Stream<Order>, _: &Command| Ok(None)),
            )
            .build()
            .unwrap()
    }

    fn place(id: StreamId, total: u32) -> Command {
        Command::new("place", "order", json!({ "total": total })).with_stream_id(id)
    }

    #[tokio::test]
    async fn place_command_persists_and_publishes_version_one() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());
        let ctx = Context::background();
        let id = StreamId::new();

        let command = place(id, 3);
        let reply = engine.handle_command(&ctx, &command).await.unwrap();

        assert_eq!(reply.command_id(), command.id());
        assert_eq!(reply.version(), 1);
        assert!(reply.is_ok());

        let stored = storage.inner().load(&ctx, id, None).await.unwrap();
        assert_eq!(stored.previous_version(), 1);
        assert_eq!(stored.state().total, 3);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name(), "placed");
        assert_eq!(published[0].stream_id(), id);
        assert_eq!(published[0].version(), 1);
        assert_eq!(storage.mark_unpublished_calls(), 0);
    }

    #[tokio::test]
    async fn replaying_a_create_command_conflicts_and_leaves_storage_unchanged() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());
        let ctx = Context::background();
        let id = StreamId::new();
        let command = place(id, 3);

        engine.handle_command(&ctx, &command).await.unwrap();
        let err = engine.handle_command(&ctx, &command).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(
            err,
            MutationError::VersionConflict(StorageError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            })
        ));
        assert_eq!(storage.inner().version_of(id).unwrap(), Some(1));
        assert_eq!(storage.inner().history(id).unwrap().len(), 1);
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_command_touches_neither_storage_nor_publisher() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());

        let command = Command::new("refund", "order", json!({})).with_stream_id(StreamId::new());
        let err = engine.handle_command(&Context::background(), &command).await.unwrap_err();

        assert!(matches!(err, MutationError::ControllerNotFound(name) if name == "refund"));
        assert_eq!(storage.load_calls(), 0);
        assert_eq!(storage.persist_calls(), 0);
        assert_eq!(publisher.publish_calls(), 0);
    }

    #[tokio::test]
    async fn command_for_another_stream_type_is_rejected() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());

        let command = Command::new("place", "cart", json!({ "total": 1 }));
        let err = engine.handle_command(&Context::background(), &command).await.unwrap_err();

        assert!(matches!(
            err,
            MutationError::StreamMismatch { ref expected, ref found }
                if expected == "order" && found == "cart"
        ));
        assert_eq!(storage.persist_calls(), 0);
        assert_eq!(publisher.publish_calls(), 0);
    }

    #[tokio::test]
    async fn no_op_command_replies_with_current_version_without_io() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());
        let ctx = Context::background();
        let id = StreamId::new();
        engine.handle_command(&ctx, &place(id, 5)).await.unwrap();

        let touch = Command::new("touch", "order", json!(null)).with_stream_id(id);
        let reply = engine.handle_command(&ctx, &touch).await.unwrap();

        assert_eq!(reply.version(), 1);
        assert_eq!(storage.persist_calls(), 1);
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_command_is_discarded() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());
        let ctx = Context::background();

        let err = engine.handle_command(&ctx, &place(StreamId::new(), 0)).await.unwrap_err();
        assert!(matches!(err, MutationError::Rejected(DomainError::Validation(_))));

        let malformed =
            Command::new("place", "order", json!("three")).with_stream_id(StreamId::new());
        let err = engine.handle_command(&ctx, &malformed).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Rejected(DomainError::Payload(PayloadError::Decode { .. }))
        ));

        assert_eq!(storage.persist_calls(), 0);
        assert_eq!(publisher.publish_calls(), 0);
        assert!(storage.inner().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_skips_publication() {
        let storage = SpyStorage::new("order");
        storage.fail_persist();
        let publisher = SpyPublisher::new();
        let engine = order_engine(storage.clone(), publisher.clone());

        let err = engine
            .handle_command(&Context::background(), &place(StreamId::new(), 2))
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::PersistFailed(StorageError::Backend(_))));
        assert_eq!(publisher.publish_calls(), 0);
        assert_eq!(storage.mark_unpublished_calls(), 0);
    }

    #[tokio::test]
    async fn publish_failure_is_partial_and_recovered_by_the_relay() {
        let storage = SpyStorage::new("order");
        let publisher = SpyPublisher::new();
        publisher.fail_next(1);
        let engine = order_engine(storage.clone(), publisher.clone());
        let ctx = Context::background();
        let id = StreamId::new();

        let err = engine.handle_command(&ctx, &place(id, 7)).await.unwrap_err();
        assert!(err.is_partial());
        assert!(matches!(err, MutationError::PublishFailed { compensation: None, .. }));
        assert_eq!(storage.mark_unpublished_calls(), 1);
        assert_eq!(storage.inner().version_of(id).unwrap(), Some(1));
        assert!(publisher.published().is_empty());

        let relay = OutboxRelay::new(
            storage.inner().clone(),
            publisher.clone(),
            RelayConfig::default(),
        );
        assert_eq!(relay.run_once(&ctx).await.unwrap(), 1);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].stream_id(), id);
        assert!(storage.inner().pending(&ctx, 10).await.unwrap().is_empty());
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct GroupJoined {
        user_id: StreamId,
        group: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Group {
        name: String,
        members: Vec<StreamId>,
    }

    impl State for Group {
        fn apply(&mut self, event: &Event) -> Result<(), PayloadError> {
            match event.name() {
                "groupJoined" => {
                    let joined: GroupJoined = event.decode()?;
                    self.name = joined.group;
                    self.members.push(joined.user_id);
                    Ok(())
                }
                other => Err(PayloadError::unexpected(other)),
            }
        }
    }

    fn pick_user(event: &Event) -> Pick {
        event
            .decode::<GroupJoined>()
            .map(|joined| Pick::One(joined.user_id))
            .unwrap_or_default()
    }

    fn user_joined(stream: &mut Stream<Membership>, event: &Event) -> Result<(), DomainError> {
        let payload: GroupJoined = event.decode()?;
        stream.mutate("userJoined", &joined(&payload.group))?;
        Ok(())
    }

    #[tokio::test]
    async fn group_joined_cascades_into_the_user_stream() {
        let ctx = Context::background();
        let bus = Arc::new(PartitionedBus::new(BusConfig { partitions: 4, capacity: 8 }).unwrap());

        let users = Arc::new(InMemoryStorage::<Membership>::new("user").unwrap());
        let user_engine = Arc::new(
            Mutator::builder(users.clone(), bus.clone())
                .event("groupJoined", event_fn(pick_user, user_joined))
                .ignore_events(["userJoined"])
                .build()
                .unwrap(),
        );

        let groups = Arc::new(InMemoryStorage::<Group>::new("group").unwrap());
        let group_engine = Mutator::builder(groups.clone(), bus.clone())
            .command_create(
                "join",
                command_fn(|stream: &mut Stream<Group>, command: &Command| {
                    let joined: GroupJoined = command.decode()?;
                    stream.mutate("groupJoined", &joined)?;
                    Ok(None)
                }),
            )
            .build()
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen_by_projection = seen.clone();
        bus.subscribe(
            "group",
            [Arc::new(SinkHandler::new(user_engine.clone()).on(["groupJoined"]))
                as Arc<dyn EventHandler>],
        )
        .unwrap();
        bus.subscribe(
            "user",
            [Arc::new(Projection::new().on("userJoined", move |e: &Event| {
                seen_by_projection.lock().unwrap().push(e.decode::<UserJoined>()?.group);
                Ok(())
            })) as Arc<dyn EventHandler>],
        )
        .unwrap();

        let listener = {
            let bus = bus.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { bus.listen(&ctx).await })
        };
        while !bus.is_listening() {
            tokio::task::yield_now().await;
        }

        let seeded = users.blank_stream();
        let user = seeded.id();
        users.persist(&ctx, &seeded).await.unwrap();

        let join = Command::from_typed(
            "join",
            "group",
            &GroupJoined {
                user_id: user,
                group: "rustaceans".to_string(),
            },
        )
        .unwrap()
        .with_stream_id(StreamId::new());
        let reply = group_engine.handle_command(&ctx, &join).await.unwrap();
        assert_eq!(reply.version(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("userJoined should reach the user projection");

        bus.close().await;
        listener.await.unwrap().unwrap();

        let user_stream = users.load(&ctx, user, None).await.unwrap();
        assert_eq!(user_stream.state().groups, vec!["rustaceans".to_string()]);
        assert_eq!(user_stream.previous_version(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["rustaceans".to_string()]);
    }

    fn membership_engine(
        storage: SpyStorage<Membership>,
        config: &EngineConfig,
    ) -> Mutator<Membership, SpyStorage<Membership>, SpyPublisher> {
        Mutator::builder(storage, SpyPublisher::new())
            .with_config(config)
            .event("groupJoined", event_fn(pick_user, user_joined))
            .event(
                "broadcast",
                event_fn(
                    |event: &Event| Pick::Many(event.decode::<Vec<StreamId>>().unwrap_or_default()),
                    |stream: &mut Stream<Membership>, _: &Event| {
                        stream.mutate("userJoined", &joined("everyone"))?;
                        Ok(())
                    },
                ),
            )
            .build()
            .unwrap()
    }

    fn group_event(name: &str, payload: serde_json::Value) -> Event {
        Event::new(name, "group", StreamId::new(), None, 1, payload)
    }

    #[tokio::test]
    async fn lenient_mode_ignores_what_strict_mode_reports() {
        let lenient = EngineConfig {
            strict: false,
            ignored_events: vec!["userJoined".to_string()],
            placeholder_every: None,
        };
        let strict = EngineConfig {
            strict: true,
            ..lenient.clone()
        };
        let ctx = Context::background();
        let lenient_engine = membership_engine(SpyStorage::new("user"), &lenient);
        let strict_engine = membership_engine(SpyStorage::new("user"), &strict);

        let own = group_event("userJoined", json!({ "group": "g" }));
        let unknown = group_event("groupRenamed", json!({}));
        let unpicked = group_event("groupJoined", json!("not a GroupJoined payload"));

        for event in [&own, &unknown, &unpicked] {
            lenient_engine.handle_event(&ctx, event).await.unwrap();
        }

        assert!(matches!(
            strict_engine.handle_event(&ctx, &own).await,
            Err(MutationError::SelfEvent(_))
        ));
        assert!(matches!(
            strict_engine.handle_event(&ctx, &unknown).await,
            Err(MutationError::ControllerNotFound(_))
        ));
        assert!(matches!(
            strict_engine.handle_event(&ctx, &unpicked).await,
            Err(MutationError::NoStreamPicked(_))
        ));
    }

    #[tokio::test]
    async fn fan_out_stops_at_the_first_failing_stream() {
        let storage = SpyStorage::<Membership>::new("user");
        let ctx = Context::background();
        let mut existing = Vec::new();
        for _ in 0..2 {
            let stream = storage.blank_stream();
            storage.inner().persist(&ctx, &stream).await.unwrap();
            existing.push(stream.id());
        }
        let missing = StreamId::new();
        let engine = membership_engine(storage.clone(), &EngineConfig::default());

        let event = group_event("broadcast", json!([existing[0], missing, existing[1]]));
        let err = engine.handle_event(&ctx, &event).await.unwrap_err();

        assert!(matches!(
            err,
            MutationError::LoadFailed(StorageError::NotFound { id, .. }) if id == missing
        ));
        assert_eq!(storage.inner().version_of(existing[0]).unwrap(), Some(1));
        assert_eq!(storage.inner().version_of(existing[1]).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn fan_out_updates_every_picked_stream() {
        let storage = SpyStorage::<Membership>::new("user");
        let ctx = Context::background();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let stream = storage.blank_stream();
            storage.inner().persist(&ctx, &stream).await.unwrap();
            ids.push(stream.id());
        }
        let engine = membership_engine(storage.clone(), &EngineConfig::default());

        engine
            .handle_event(&ctx, &group_event("broadcast", json!(ids.clone())))
            .await
            .unwrap();

        for id in ids {
            let stream = storage.inner().load(&ctx, id, None).await.unwrap();
            assert_eq!(stream.state().groups, vec!["everyone".to_string()]);
        }
    }
}
