//! Behaviour tests for collections wired together the way namespaces wire
//! them: one peer's outbox frames are fed into the other peer's remote
//! methods.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomsync_collection::{
    outbox, Collection, CollectionConfig, CollectionRegistry, Origin, OutboxReceiver,
    RemoteOrigin,
};
use roomsync_protocol::{CollectionEvent, ConnectionId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Score {
    player: String,
    points: u32,
}

fn score(player: &str, points: u32) -> Score {
    Score {
        player: player.into(),
        points,
    }
}

struct Peer {
    scores: Box<dyn roomsync_collection::AnyCollection>,
    rx: OutboxReceiver,
}

impl Peer {
    fn new(registry: &CollectionRegistry) -> Self {
        let (tx, rx) = outbox();
        let scores = registry.build(&"score".into(), tx).expect("registered");
        Self { scores, rx }
    }

    fn typed(&mut self) -> &mut Collection<Score> {
        self.scores
            .as_any_mut()
            .downcast_mut::<Collection<Score>>()
            .expect("score collection")
    }

    /// Delivers everything this peer sent into `other`.
    fn relay_to(&mut self, other: &mut Peer) -> usize {
        let mut delivered = 0;
        while let Ok(outbound) = self.rx.try_recv() {
            other
                .scores
                .apply_mutation(&outbound.mutation, RemoteOrigin::default())
                .expect("valid frame");
            delivered += 1;
        }
        delivered
    }
}

fn registry(config: CollectionConfig) -> CollectionRegistry {
    let mut registry = CollectionRegistry::new();
    registry.register::<Score>("score", config).unwrap();
    registry
}

#[test]
fn test_score_round_trip_between_peers() {
    let registry = registry(CollectionConfig::default());
    let mut alice = Peer::new(&registry);
    let mut bob = Peer::new(&registry);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bob.typed().subscribe(CollectionEvent::Update, move |n| {
        sink.lock()
            .unwrap()
            .push((n.origin, n.change.data().map(|s| s.points)));
    });

    alice.typed().add_item("s1", score("ann", 0)).unwrap();
    alice.typed().update_item("s1", score("ann", 7)).unwrap();
    assert_eq!(alice.relay_to(&mut bob), 2);

    assert_eq!(bob.typed().get_item("s1"), Some(&score("ann", 7)));
    assert_eq!(*seen.lock().unwrap(), vec![(Origin::Remote, Some(7))]);

    alice.typed().remove_item("s1");
    alice.relay_to(&mut bob);
    assert!(bob.typed().is_empty());
}

#[test]
fn test_local_event_counts_follow_operations() {
    let registry = registry(CollectionConfig::default());
    let mut peer = Peer::new(&registry);
    let counts = Arc::new(Mutex::new([0usize; 3]));

    for (slot, kind) in [CollectionEvent::Add, CollectionEvent::Update, CollectionEvent::Remove]
        .into_iter()
        .enumerate()
    {
        let sink = Arc::clone(&counts);
        peer.typed().subscribe(kind, move |_| sink.lock().unwrap()[slot] += 1);
    }

    let scores = peer.typed();
    scores.add_item("a", score("a", 1)).unwrap();
    scores.add_item("b", score("b", 1)).unwrap();
    scores.update_item("a", score("a", 2)).unwrap();
    scores.update_item("a", score("a", 3)).unwrap();
    scores.update_item("c", score("c", 1)).unwrap(); // behaves as add
    scores.remove_item("b");

    assert_eq!(*counts.lock().unwrap(), [3, 2, 1]);
}

#[test]
fn test_export_import_is_idempotent() {
    let registry = registry(CollectionConfig::default());
    let mut source = Peer::new(&registry);
    source.typed().add_item("a", score("a", 1)).unwrap();
    source.typed().add_item("b", score("b", 2)).unwrap();
    let export = source.scores.export().unwrap();

    let mut target = Peer::new(&registry);
    for _ in 0..2 {
        let imported = target
            .scores
            .import(export.item_ids.clone(), export.payload.clone())
            .unwrap();
        assert_eq!(imported, 2);
    }
    assert_eq!(target.scores.len(), 2);
    assert_eq!(target.scores.export().unwrap(), export);
    // Imports are never re-sent.
    assert!(target.rx.try_recv().is_err());
}

#[test]
fn test_rebroadcast_excludes_sender_and_keeps_raw_bytes() {
    let registry = registry(CollectionConfig::default());
    let mut writer = Peer::new(&registry);
    let mut server = Peer::new(&registry);

    writer.typed().add_item("s1", score("ann", 1)).unwrap();
    let sent = writer.rx.try_recv().unwrap();

    let sender = ConnectionId::new(3);
    server
        .scores
        .apply_mutation(&sent.mutation, RemoteOrigin::relayed_from(sender))
        .unwrap();

    let relayed = server.rx.try_recv().unwrap();
    assert_eq!(relayed.exclude, Some(sender));
    assert_eq!(relayed.mutation, sent.mutation);
}

#[test]
fn test_unknown_event_payload_mismatch_is_reported() {
    let mut registry = CollectionRegistry::new();
    registry
        .register::<u32>("counter", CollectionConfig::default())
        .unwrap();
    let (tx, _rx) = outbox();
    let mut counter = registry.build(&"counter".into(), tx).unwrap();

    let mutation = roomsync_protocol::CollectionMutation {
        collection_type_id: "counter".into(),
        event: CollectionEvent::Add,
        item_id: "x".into(),
        payload: br#""not a number""#.to_vec(),
    };
    assert!(counter.apply_mutation(&mutation, RemoteOrigin::default()).is_err());
    assert!(counter.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reactive_throttled_writes_converge_on_last_value() {
    let registry = registry(CollectionConfig {
        reactive: true,
        throttle: Duration::from_millis(30),
        ..CollectionConfig::default()
    });
    let mut alice = Peer::new(&registry);
    let mut bob = Peer::new(&registry);

    alice.typed().add_item("s1", score("ann", 0)).unwrap();
    for _ in 0..5 {
        alice.typed().modify_item("s1", |s| s.points += 1).unwrap();
        tokio::time::advance(Duration::from_millis(2)).await;
    }
    assert_eq!(alice.relay_to(&mut bob), 1);
    assert_eq!(bob.typed().get_item("s1").unwrap().points, 0);

    let due = alice.scores.next_due().expect("a pending update");
    tokio::time::advance(due - Instant::now()).await;
    assert_eq!(alice.scores.flush_due(Instant::now()), 1);
    assert_eq!(alice.relay_to(&mut bob), 1);
    assert_eq!(bob.typed().get_item("s1").unwrap().points, 5);
}

#[test]
fn test_collection_readonly_suppresses_all_reactive_writes() {
    let registry = registry(CollectionConfig {
        reactive: true,
        readonly: true,
        ..CollectionConfig::default()
    });
    let mut peer = Peer::new(&registry);
    peer.typed().add_item("s1", score("ann", 0)).unwrap();
    let _ = peer.rx.try_recv();

    assert!(peer.typed().record("s1").unwrap().is_readonly());
    assert!(!peer.typed().modify_item("s1", |s| s.points = 3).unwrap());
    assert!(peer.rx.try_recv().is_err());

    peer.typed().set_readonly(false, None).unwrap();
    peer.typed().set_readonly(false, Some("s1")).unwrap();
    assert!(peer.typed().modify_item("s1", |s| s.points = 4).unwrap());
    assert!(peer.rx.try_recv().is_ok());
}
