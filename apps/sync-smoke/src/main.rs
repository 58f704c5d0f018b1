mod logging;

use std::{process, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use sync_core::{EventStream, SubscriptionState, SyncEvent, TimelineItem};
use sync_realtime::{InMemoryBackend, SyncConfig, SyncHandle, spawn_engine};
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{info, warn};

const SELF_ID: &str = "me";
const PEER_ID: &str = "yuki";
const ROOM_ID: &str = "trip-kyoto";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(1);
        }
    };
    info!(?config, "starting sync-smoke");

    let backend = seeded_backend();
    let handle = spawn_engine(Arc::new(backend.clone()), config);
    let mut events = handle.events();

    if let Err(step) = run_script(&handle, &backend, &mut events).await {
        eprintln!("Smoke run failed at step: {step}");
        process::exit(1);
    }

    let _ = handle.shutdown();
    println!("Smoke run complete.");
}

fn seeded_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::with_user(SELF_ID);
    backend.add_room(ROOM_ID, &[SELF_ID, PEER_ID]);
    backend.add_room("trip-osaka", &[SELF_ID, "kenji", "mina"]);

    let earlier = Utc::now() - TimeDelta::minutes(30);
    backend.seed_message(ROOM_ID, PEER_ID, "Landed at KIX", earlier);
    backend.seed_message(ROOM_ID, SELF_ID, "Welcome!", earlier + TimeDelta::minutes(1));
    backend.seed_message("trip-osaka", "kenji", "Dinner at 7?", earlier);
    backend
}

async fn run_script(
    handle: &SyncHandle,
    backend: &InMemoryBackend,
    events: &mut EventStream,
) -> Result<(), &'static str> {
    handle
        .subscribe_to_room_list()
        .map_err(|_| "subscribe to room list")?;
    wait_for(events, |event| matches!(event, SyncEvent::UnreadReplaced { .. }))
        .await
        .ok_or("cold load")?;
    print_rooms(handle).await;

    let session = handle.open_room(ROOM_ID).map_err(|_| "open room")?;
    wait_for(events, |event| {
        matches!(
            event,
            SyncEvent::SubscriptionStateChanged {
                state: SubscriptionState::Open,
                scope,
            } if scope.label() == format!("room:{ROOM_ID}")
        )
    })
    .await
    .ok_or("room channel open")?;

    session
        .send_message("Meet at the station at 9")
        .map_err(|_| "send message")?;
    wait_for(events, |event| {
        matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
            if items.iter().any(|item| matches!(item, TimelineItem::Confirmed(message)
                if message.content == "Meet at the station at 9")))
    })
    .await
    .ok_or("send echo")?;

    backend.publish_message("trip-osaka", "mina", "Running late");
    wait_for(events, |event| {
        matches!(event, SyncEvent::UnreadChanged { room_id, .. } if room_id == "trip-osaka")
    })
    .await
    .ok_or("unread increment")?;

    backend.publish_message(ROOM_ID, PEER_ID, "See you there");
    wait_for(events, |event| {
        matches!(event, SyncEvent::RoomMessagesChanged { items, .. }
            if items.iter().any(|item| item.content() == "See you there"))
    })
    .await
    .ok_or("inbound message")?;

    for item in session.messages().await.map_err(|_| "read messages")? {
        match item {
            TimelineItem::Confirmed(message) => {
                println!("  [{}] {}: {}", message.timestamp, message.sender_id, message.content);
            }
            TimelineItem::Pending(pending) => {
                println!("  [pending] {}: {}", pending.sender_id, pending.content);
            }
        }
    }

    session.close().map_err(|_| "close room")?;
    print_rooms(handle).await;
    Ok(())
}

async fn print_rooms(handle: &SyncHandle) {
    let Ok(rooms) = handle.room_list().await else {
        warn!("engine stopped before answering");
        return;
    };
    let aggregate = handle.aggregate_unread().await.unwrap_or_default();
    println!("Rooms (unread total {aggregate}):");
    for room in rooms {
        println!(
            "  {} unread={} last={:?}",
            room.id, room.unread_count, room.last_message
        );
    }
}

async fn wait_for<F>(events: &mut EventStream, mut matches: F) -> Option<SyncEvent>
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
