//! A shared scoreboard: one server, a few players, one "score" collection.
//!
//! Every player owns its own record and bumps it through `modify_item`;
//! the server relays each change to everyone else. Run with
//! `RUST_LOG=debug` to see frames being routed.

use std::time::Duration;

use roomsync::prelude::*;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Record type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    name: String,
    points: u32,
}

const SCORE: &str = "score";
const ARENA: &str = "arena";

fn registry() -> Result<CollectionRegistry, CollectionError> {
    let mut registry = CollectionRegistry::new();
    registry.register::<Score>(
        SCORE,
        CollectionConfig {
            throttle: Duration::from_millis(50),
            reactive: true,
            ..CollectionConfig::default()
        },
    )?;
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Players
// ---------------------------------------------------------------------------

/// Connects a player, logs everyone else's score changes, and adds its
/// own record.
async fn join_player(addr: &str, name: &str) -> Result<RoomsyncClient, RoomsyncError> {
    let config = ClientConfig::new(format!("ws://{addr}"), ARENA).caller_id(name);
    let client = RoomsyncClient::new(config, registry()?, JsonCodec)?;
    let scores = client.collection::<Score>(SCORE);

    let viewer = name.to_string();
    scores
        .subscribe(CollectionEvent::Update, move |n| {
            if n.origin != Origin::Remote {
                return;
            }
            if let Some(score) = n.change.data() {
                tracing::info!(%viewer, player = %score.name, points = score.points, "score changed");
            }
        })
        .await?;

    client.connect().await?;
    scores
        .add_item(
            name,
            Score {
                name: name.to_string(),
                points: 0,
            },
        )
        .await?;
    Ok(client)
}

/// Awards `points` to `name` `rounds` times. Bursts are coalesced by the
/// collection throttle.
async fn play(client: &RoomsyncClient, name: &str, rounds: u32, points: u32) -> Result<(), RoomsyncError> {
    let scores = client.collection::<Score>(SCORE);
    for _ in 0..rounds {
        scores.modify_item(name, move |s| s.points += points).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

async fn print_board(client: &RoomsyncClient) -> Result<(), RoomsyncError> {
    let mut board = client.collection::<Score>(SCORE).items().await?;
    board.sort_by(|a, b| b.1.points.cmp(&a.1.points).then_with(|| a.0.cmp(&b.0)));
    for (rank, (_, score)) in board.iter().enumerate() {
        println!("{:>2}. {:<8} {:>4}", rank + 1, score.name, score.points);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let server = RoomsyncServer::builder()
        .bind(&addr)
        .build(registry()?, AllowAll)
        .await?;
    let addr = server.local_addr()?.to_string();
    tracing::info!(%addr, "scoreboard server listening");
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    let alice = join_player(&addr, "alice").await?;
    let bob = join_player(&addr, "bob").await?;

    tokio::try_join!(play(&alice, "alice", 5, 10), play(&bob, "bob", 8, 5))?;

    // Let the last throttled updates go out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_board(&alice).await?;

    alice.disconnect().await;
    bob.disconnect().await;
    Ok(())
}
