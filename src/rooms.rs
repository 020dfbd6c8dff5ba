//! Room-list subscription.
//!
//! The server always sends the full list, so every `room_list`/`room_update`
//! frame replaces the local collection. A room created by this client can be
//! shown before the next snapshot; that snapshot then overwrites it.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::connection::{Connection, SessionParams, Subscription};
use crate::error::SessionError;
use crate::protocol::{RoomSummary, ServerMessage};

const LISTENER_ID: &str = "rooms-list";

/// Apply one inbound frame. Returns whether the list changed.
pub fn apply_room_frame(rooms: &mut Vec<RoomSummary>, msg: &ServerMessage) -> bool {
    match msg {
        ServerMessage::RoomList { rooms: snapshot }
        | ServerMessage::RoomUpdate { rooms: snapshot } => {
            *rooms = snapshot.clone();
            true
        }
        _ => false,
    }
}

/// Put a just-created room at the front unless the list already has it.
pub fn insert_optimistic(rooms: &mut Vec<RoomSummary>, room: RoomSummary) -> bool {
    if rooms.iter().any(|r| r.id == room.id) {
        return false;
    }
    rooms.insert(0, room);
    true
}

pub struct RoomsList {
    connection: Connection,
    rooms: Arc<watch::Sender<Vec<RoomSummary>>>,
    _subscription: Subscription,
}

impl RoomsList {
    /// Subscribe to `connection` and open it in room-list mode.
    pub fn attach(
        connection: Connection,
        token: impl Into<String>,
        initial: Vec<RoomSummary>,
    ) -> Self {
        let list = Self::subscribe(connection, initial);
        list.connection.connect(SessionParams::room_list(token));
        list
    }

    /// Like [`attach`](Self::attach), running `on_initial_failure` if the first connect fails.
    pub fn attach_or_else(
        connection: Connection,
        token: impl Into<String>,
        initial: Vec<RoomSummary>,
        on_initial_failure: impl FnOnce(SessionError) + Send + 'static,
    ) -> Self {
        let list = Self::subscribe(connection, initial);
        list.connection
            .connect_or_else(SessionParams::room_list(token), on_initial_failure);
        list
    }

    fn subscribe(connection: Connection, initial: Vec<RoomSummary>) -> Self {
        let (tx, _) = watch::channel(initial);
        let rooms = Arc::new(tx);
        let sink = Arc::clone(&rooms);
        let subscription = connection.add_listener(LISTENER_ID, move |msg| {
            sink.send_if_modified(|rooms| apply_room_frame(rooms, msg));
            if let ServerMessage::RoomList { .. } | ServerMessage::RoomUpdate { .. } = msg {
                debug!("[ROOMS] Snapshot with {} rooms", sink.borrow().len());
            }
        });
        Self {
            connection,
            rooms,
            _subscription: subscription,
        }
    }

    pub fn rooms(&self) -> watch::Receiver<Vec<RoomSummary>> {
        self.rooms.subscribe()
    }

    pub fn snapshot(&self) -> Vec<RoomSummary> {
        self.rooms.borrow().clone()
    }

    pub fn insert_optimistic(&self, room: RoomSummary) {
        info!("[ROOMS] Showing new room {} before next snapshot", room.id);
        self.rooms.send_if_modified(|rooms| insert_optimistic(rooms, room));
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Close the room-list connection.
    pub fn disconnect(self) {
        self.connection.disconnect();
    }
}
