//! Ping Pong - two emitters talking through one exchange
//!
//! Two emitters share the process-wide `memory://ping-pong` broker. Each one
//! listens for the other's event and answers until the rally ends, then both
//! release their subscriptions.
//!
//! Run with: cargo run -p broker-emitter --example ping_pong
//! Set BROKER_EMITTER_LOG_MODE=debug to watch subscriptions come and go.

use std::time::Duration;

use broker_emitter::prelude::*;
use tokio::sync::mpsc;

const RALLY: u32 = 5;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    broker_emitter::init_logging_from_env()?;

    println!("=== Broker Emitter Ping Pong ===\n");

    let config = EmitterConfig::new("ping-pong").with_uri("memory://ping-pong");
    let left = Emitter::new(config.clone().with_name_prefix("left"))?;
    let right = Emitter::new(config.with_name_prefix("right"))?;
    left.connect().await?;
    right.connect().await?;
    println!("Connected {} and {}", left.name(), right.name());

    // Listeners run on the consumer task, so replies are handed to the main loop.
    let (to_right, mut right_inbox) = mpsc::unbounded_channel::<u32>();
    let (to_left, mut left_inbox) = mpsc::unbounded_channel::<u32>();

    let ping = right.on("game.ping", move |message: &Message| {
        if let Ok(n) = message.json::<u32>() {
            let _ = to_right.send(n);
        }
    });
    let pong = left.on("game.pong", move |message: &Message| {
        if let Ok(n) = message.json::<u32>() {
            let _ = to_left.send(n);
        }
    });
    let ping_id = ping.await?;
    let pong_id = pong.await?;

    let watcher = left.on("game.#", |message: &Message| {
        println!("  [spectator] {} {:?}", message.routing_key, message.body_str());
    });
    let watcher_id = watcher.await?;

    left.emit_json("game.ping", &1u32, PublishOptions::new()).await?;

    loop {
        tokio::select! {
            Some(n) = right_inbox.recv() => {
                println!("right got ping {}", n);
                right.emit_json("game.pong", &n, PublishOptions::new()).await?;
            }
            Some(n) = left_inbox.recv() => {
                println!("left got pong {}", n);
                if n >= RALLY {
                    break;
                }
                left.emit_json("game.ping", &(n + 1), PublishOptions::new()).await?;
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                println!("rally stalled");
                break;
            }
        }
    }

    left.remove_listener("game.#", watcher_id).await?;
    left.remove_listener("game.pong", pong_id).await?;
    right.remove_listener("game.ping", ping_id).await?;
    println!(
        "\nActive subscriptions after the rally: left={:?} right={:?}",
        left.active_subscriptions(),
        right.active_subscriptions()
    );

    left.close().await?;
    right.close().await?;
    Ok(())
}
