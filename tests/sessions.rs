mod common;

use std::sync::Arc;
use std::time::Duration;

use arena_session::battle::{BattleExit, BattlePhase, BattleSession};
use arena_session::cache::{CountdownCache, MemoryCache};
use arena_session::connection::{Connection, SessionParams};
use arena_session::lobby::{LobbyContext, LobbyExit, LobbyPhase, LobbySession};
use arena_session::protocol::{Role, RoomId, RoomSummary};
use arena_session::rooms::RoomsList;
use common::{FakeConnector, Peer, Peers, Sent, advance, connection, settle};
use serde_json::{Value, json};
use tokio::time::Instant;

fn participants(entries: &[(&str, Option<&str>)]) -> Value {
    let participants: Vec<Value> = entries
        .iter()
        .map(|(username, role)| json!({"username": username, "role": role, "status": "joined"}))
        .collect();
    json!({"type": "participant_list", "participants": participants})
}

fn room(id: &str, name: &str) -> RoomSummary {
    serde_json::from_value(json!({
        "id": id,
        "name": name,
        "capacity": 4,
        "participant_count": 1,
        "status": "waiting"
    }))
    .unwrap()
}

fn verified(username: &str, position: u32, completion_time: f64) -> Value {
    json!({
        "type": "code_verified",
        "username": username,
        "position": position,
        "completion_time": completion_time
    })
}

/// Join room 42 as `me` and consume the open handshake.
async fn join_lobby(
    conn: &Connection,
    peers: &mut Peers,
    me: &str,
    capacity: u32,
) -> (LobbySession, Peer) {
    let context = LobbyContext::new("42", me, capacity).with_owner("ada");
    let lobby = LobbySession::join(conn.clone(), context, "t");
    let mut peer = peers.next().await;
    peer.expect("request_participants").await;
    peer.expect("request_chat_history").await;
    (lobby, peer)
}

#[tokio::test(start_paused = true)]
async fn countdown_reaches_battle_after_five_seconds() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 2).await;
    assert_eq!(lobby.snapshot().phase, LobbyPhase::Connecting);

    peer.send(participants(&[("ada", Some("host")), ("bob", None)]));
    peer.send(json!({"type": "countdown", "countdown": 5}));
    settle().await;
    assert!(matches!(lobby.snapshot().phase, LobbyPhase::Countdown(_)));
    assert_eq!(lobby.snapshot().role, Role::Participant);

    let started = Instant::now();
    let exit = lobby.finished().await;
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(exit, LobbyExit::BattleStarted { question: None });

    // A trailing start_battle only fills in the question
    peer.send(json!({"type": "start_battle", "question": {"id": 3}}));
    peer.send(json!({"type": "countdown", "countdown": 9}));
    settle().await;
    assert_eq!(
        lobby.snapshot().phase,
        LobbyPhase::BattleStarted { question: Some(json!({"id": 3})) }
    );
    advance(Duration::from_secs(20)).await;
    assert!(matches!(lobby.snapshot().phase, LobbyPhase::BattleStarted { .. }));
}

#[tokio::test(start_paused = true)]
async fn server_countdown_resyncs_local_ticks() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 2).await;

    peer.send(participants(&[("ada", Some("host")), ("bob", None)]));
    peer.send(json!({"type": "countdown", "countdown": 10}));
    advance(Duration::from_millis(3_500)).await;
    let LobbyPhase::Countdown(timer) = lobby.snapshot().phase else {
        panic!("expected countdown");
    };
    assert_eq!(timer.remaining(), Some(7));

    peer.send(json!({"type": "countdown", "countdown": 9}));
    settle().await;
    let LobbyPhase::Countdown(timer) = lobby.snapshot().phase else {
        panic!("expected countdown");
    };
    assert_eq!(timer.remaining(), Some(9));
}

#[tokio::test(start_paused = true)]
async fn kick_for_someone_else_is_ignored() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    peer.send(participants(&[("ada", Some("host")), ("bob", None), ("cy", None)]));
    peer.send(json!({"type": "kicked", "username": "cy"}));
    settle().await;

    assert_eq!(lobby.snapshot().phase, LobbyPhase::Synced);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn kick_for_us_disconnects_then_exits_after_grace() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, mut peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    peer.send(participants(&[("ada", Some("host")), ("bob", None)]));
    peer.send(json!({"type": "kicked", "username": "bob"}));
    assert_eq!(peer.recv().await, Some(Sent::Close(1000)));
    settle().await;

    assert_eq!(lobby.snapshot().phase, LobbyPhase::Kicked);
    assert_eq!(conn.listener_count(), 0);

    let started = Instant::now();
    assert_eq!(lobby.finished().await, LobbyExit::Kicked);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn room_closed_exits_after_grace() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    peer.send(json!({"type": "room_closed", "message": "Host left"}));
    settle().await;

    let started = Instant::now();
    let exit = lobby.finished().await;
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(
        exit,
        LobbyExit::RoomClosed {
            message: Some("Host left".to_string())
        }
    );
}

#[tokio::test(start_paused = true)]
async fn own_chat_echo_is_shown_once() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, mut peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    lobby.send_chat("  glhf ").unwrap();
    let sent = peer.expect("chat_message").await;
    assert_eq!(sent["message"], "glhf");
    assert_eq!(sent["sender"], "bob");
    assert_eq!(sent["room_id"], "42");
    let local = lobby.snapshot().chat.entries()[0].clone();
    assert!(local.pending);
    assert_eq!(sent["timestamp"], local.message.timestamp.as_str());

    peer.send(json!({
        "type": "chat_message",
        "id": 9,
        "sender": "bob",
        "message": "glhf",
        "timestamp": "2026-10-16T10:00:00Z"
    }));
    settle().await;
    let chat = lobby.snapshot().chat;
    assert_eq!(chat.len(), 1);
    assert_eq!(chat.entries()[0].message.id, "9");
    assert!(!chat.entries()[0].pending);

    peer.send(json!({
        "type": "chat_history",
        "messages": [
            {"id": 8, "sender": "ada", "message": "hi", "timestamp": "2026-10-16T09:59:00Z"},
            {"id": 9, "sender": "bob", "message": "glhf", "timestamp": "2026-10-16T10:00:00Z"}
        ]
    }));
    settle().await;
    let texts: Vec<String> = lobby.snapshot().chat.messages().map(|m| m.message.clone()).collect();
    assert_eq!(texts, vec!["hi", "glhf"]);

    assert!(lobby.send_chat("   ").is_err());
}

#[tokio::test(start_paused = true)]
async fn start_requires_a_ready_majority() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, mut peer) = join_lobby(&conn, &mut peers, "ada", 5).await;

    peer.send(participants(&[("ada", Some("host")), ("bob", None), ("cy", None)]));
    peer.send(json!({"type": "ready_status", "username": "bob", "ready": true}));
    settle().await;
    assert!(lobby.snapshot().is_host());

    let err = lobby.start_countdown(10).unwrap_err();
    assert!(err.to_string().contains("Minimum participants not met: 3 required"), "{err}");
    settle().await;
    assert!(peer.drain().iter().all(|s| s.kind() != Some("start_countdown")));

    peer.send(json!({"type": "ready_status", "username": "cy", "ready": true}));
    settle().await;
    lobby.start_countdown(10).unwrap();
    let frame = peer.expect("start_countdown").await;
    assert_eq!(frame["countdown"], 10);
}

#[tokio::test(start_paused = true)]
async fn host_actions_are_gated_locally() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, mut peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    peer.send(participants(&[("ada", Some("host")), ("bob", None)]));
    settle().await;

    assert!(lobby.kick("ada").is_err());
    assert!(lobby.close_room().is_err());
    assert!(lobby.start_countdown(5).is_err());

    lobby.set_ready(true).unwrap();
    assert!(lobby.snapshot().is_ready("bob"));
    let frame = peer.expect("ready_toggle").await;
    assert_eq!(frame["ready"], true);
}

#[tokio::test(start_paused = true)]
async fn left_notices_expire() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 4).await;

    peer.send(json!({"type": "participant_left", "username": "cy"}));
    peer.send(json!({"type": "participant_left", "username": "cy"}));
    settle().await;
    assert_eq!(lobby.snapshot().left_notices, ["cy"]);

    advance(Duration::from_secs(6)).await;
    assert!(lobby.snapshot().left_notices.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_lobby_reports_connection_lost() {
    let (connector, _peers) = FakeConnector::new();
    connector.refuse(true);
    let conn = connection(&connector);
    let context = LobbyContext::new("42", "bob", 2);

    let lobby = LobbySession::join_or_else(conn, context, "t", |_| {});
    assert_eq!(lobby.finished().await, LobbyExit::ConnectionLost);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn lobby_hands_off_to_battle_on_the_same_connection() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let (lobby, peer) = join_lobby(&conn, &mut peers, "bob", 2).await;

    peer.send(json!({"type": "start_battle", "question": {"id": 3}}));
    let exit = lobby.finished().await;
    assert_eq!(exit, LobbyExit::BattleStarted { question: Some(json!({"id": 3})) });
    drop(lobby);
    conn.disconnect();

    let cache = Arc::new(MemoryCache::new());
    let battle = BattleSession::join(conn.clone(), "42", "t", cache);
    let battle_peer = peers.next().await;
    settle().await;

    assert_eq!(battle_peer.url, "ws://arena.test/ws/battle/42/?token=t");
    assert_eq!(conn.listener_count(), 1);
    assert_eq!(conn.params(), Some(SessionParams::battle("42", "t")));
    assert_eq!(battle.snapshot().phase, BattlePhase::Waiting);
}

#[tokio::test(start_paused = true)]
async fn battle_clock_ticks_and_resyncs() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let cache = Arc::new(MemoryCache::new());
    let room = RoomId::from("42");

    let battle = BattleSession::join(conn, room.clone(), "t", cache.clone());
    let peer = peers.next().await;
    peer.send(json!({
        "type": "battle_started",
        "start_time": "2026-10-16T10:00:00Z",
        "time_limit": 1800
    }));
    advance(Duration::from_millis(10_500)).await;
    assert_eq!(battle.snapshot().remaining(), Some(1790));
    assert_eq!(cache.load(&room), Some(1790));

    peer.send(json!({"type": "time_update", "remaining_seconds": 1750}));
    settle().await;
    assert_eq!(battle.snapshot().remaining(), Some(1750));
    assert_eq!(cache.load(&room), Some(1750));
}

#[tokio::test(start_paused = true)]
async fn cached_clock_is_provisional() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let cache = Arc::new(MemoryCache::new());
    let room = RoomId::from("42");
    cache.store(&room, 600);

    let battle = BattleSession::join(conn, room.clone(), "t", cache.clone());
    let state = battle.snapshot();
    assert_eq!(state.remaining(), Some(600));
    assert!(!state.clock.is_authoritative());

    let peer = peers.next().await;
    peer.send(json!({"type": "time_update", "remaining_seconds": 1200}));
    settle().await;
    assert_eq!(battle.snapshot().remaining(), Some(1200));
    assert!(battle.snapshot().clock.is_authoritative());
}

#[tokio::test(start_paused = true)]
async fn completion_freezes_leaderboard_and_clears_cache() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);
    let cache = Arc::new(MemoryCache::new());
    let room = RoomId::from("42");

    let battle = BattleSession::join(conn, room.clone(), "t", cache.clone());
    let peer = peers.next().await;
    peer.send(json!({"type": "battle_started", "start_time": null, "time_limit": 600}));
    peer.send(verified("cy", 2, 80.5));
    peer.send(verified("bob", 1, 95.0));
    peer.send(json!({
        "type": "battle_completed",
        "winners": [{"username": "bob", "position": 1, "completion_time": 95.0}],
        "room_capacity": 4
    }));
    peer.send(verified("dee", 3, 120.0));

    let exit = battle.finished().await;
    let BattleExit::Completed { winners, room_capacity } = exit else {
        panic!("expected completion, got {exit:?}");
    };
    assert_eq!(winners.len(), 1);
    assert_eq!(room_capacity, Some(4));

    settle().await;
    let state = battle.snapshot();
    let names: Vec<_> = state.leaderboard.iter().map(|e| e.username.as_str()).collect();
    assert_eq!(names, vec!["bob", "cy"]);
    assert_eq!(cache.load(&room), None);

    let frozen = state.remaining();
    advance(Duration::from_secs(5)).await;
    assert_eq!(battle.snapshot().remaining(), frozen);
}

#[tokio::test(start_paused = true)]
async fn room_list_mirrors_snapshots() {
    let (connector, mut peers) = FakeConnector::new();
    let conn = connection(&connector);

    let rooms = RoomsList::attach(conn, "t", vec![room("1", "stale")]);
    assert_eq!(rooms.snapshot().len(), 1);
    let peer = peers.next().await;

    peer.send(json!({"type": "room_list", "rooms": [
        {"id": 2, "name": "two", "capacity": 4, "participants_count": 2, "status": "waiting"},
        {"id": "3", "name": "three"}
    ]}));
    settle().await;
    let ids: Vec<_> = rooms.snapshot().iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["2", "3"]);
    assert_eq!(rooms.snapshot()[0].participant_count, 2);

    rooms.insert_optimistic(room("4", "mine"));
    rooms.insert_optimistic(room("2", "dup"));
    let ids: Vec<_> = rooms.snapshot().iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["4", "2", "3"]);

    peer.send(json!({"type": "room_update", "rooms": [{"id": "2", "name": "two"}]}));
    settle().await;
    let ids: Vec<_> = rooms.snapshot().iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["2"]);
}
