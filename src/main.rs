use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arena_session::battle::{BattleExit, BattleSession};
use arena_session::cache::{CountdownCache, FileCache, MemoryCache};
use arena_session::config::{DEFAULT_SERVER_URL, SessionConfig};
use arena_session::connection::{Connection, Notice};
use arena_session::lobby::{LobbyContext, LobbyExit, LobbyPhase, LobbySession};
use arena_session::logging;
use arena_session::protocol::{LeaderboardEntry, Role, RoomId};
use arena_session::rooms::RoomsList;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "arena-session", about = "Coding-arena session client")]
struct Cli {
    /// WebSocket base URL, e.g. ws://127.0.0.1:8000
    #[arg(long, env = "ARENA_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server: String,

    #[arg(long, env = "ARENA_TOKEN")]
    token: String,

    #[arg(long, env = "ARENA_USERNAME")]
    username: Option<String>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the public room list
    Rooms,
    /// Join a lobby, then follow the battle it starts
    Lobby(LobbyArgs),
    /// Follow a running battle
    Battle(BattleArgs),
}

#[derive(Args, Debug)]
struct LobbyArgs {
    room: String,

    #[arg(long, default_value_t = 2)]
    capacity: u32,

    /// Room owner, used when the participant list carries no roles
    #[arg(long)]
    owner: Option<String>,

    #[arg(long)]
    host: bool,

    /// Mark ourselves ready once the lobby is synced
    #[arg(long)]
    ready: bool,

    /// As host, start a countdown of this many seconds once enough players are ready
    #[arg(long)]
    start: Option<u32>,

    #[arg(long)]
    chat: Option<String>,

    #[command(flatten)]
    cache: CacheArgs,
}

#[derive(Args, Debug)]
struct BattleArgs {
    room: String,

    #[command(flatten)]
    cache: CacheArgs,
}

#[derive(Args, Debug)]
struct CacheArgs {
    /// JSON file for the provisional battle countdown
    #[arg(long)]
    cache: Option<PathBuf>,
}

impl CacheArgs {
    async fn open(&self) -> Result<Arc<dyn CountdownCache>> {
        match &self.cache {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("creating cache directory {}", parent.display())
                    })?;
                }
                Ok(Arc::new(FileCache::open(path).await))
            }
            None => Ok(Arc::new(MemoryCache::new())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(&cli.log_level, cli.log_dir.as_deref());

    let config = SessionConfig::new(&cli.server);
    let connection = Connection::new(config);
    spawn_notice_logger(connection.notices());

    match cli.command {
        Command::Rooms => run_rooms(connection, cli.token).await,
        Command::Lobby(args) => {
            let Some(username) = cli.username else {
                bail!("--username (or ARENA_USERNAME) is required to join a lobby");
            };
            run_lobby(connection, cli.token, username, args).await
        }
        Command::Battle(args) => {
            let cache = args.cache.open().await?;
            run_battle(connection, cli.token, RoomId::new(args.room), cache).await
        }
    }
}

fn spawn_notice_logger(mut notices: broadcast::Receiver<Notice>) {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(Notice::Reconnecting { attempt }) => info!("Reconnecting (attempt {})", attempt),
                Ok(Notice::ReconnectExhausted { attempts }) => {
                    error!("Gave up after {} reconnect attempts", attempts)
                }
                Ok(Notice::LivenessLost) => warn!("Server stopped answering pings"),
                Ok(Notice::AuthorizationFailed(message)) => error!("Not authorized: {}", message),
                Ok(Notice::Application(message)) => warn!("Server: {}", message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} notices", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_rooms(connection: Connection, token: String) -> Result<()> {
    let rooms = RoomsList::attach_or_else(connection, token, Vec::new(), |e| {
        error!("Could not reach the room list: {}", e);
    });
    let mut updates = rooms.rooms();
    let mut active = rooms.connection().active();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                info!("[ROOMS] {} rooms", snapshot.len());
                for room in &snapshot {
                    info!(
                        "[ROOMS]   {} {:?} {}/{} {}",
                        room.id, room.name, room.participant_count, room.capacity, room.status,
                    );
                }
            }
            changed = active.changed() => {
                if changed.is_err() || !*active.borrow_and_update() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    rooms.disconnect();
    Ok(())
}

async fn run_lobby(
    connection: Connection,
    token: String,
    username: String,
    args: LobbyArgs,
) -> Result<()> {
    let room = RoomId::new(args.room.clone());
    let mut context = LobbyContext::new(room.clone(), username, args.capacity);
    if let Some(owner) = &args.owner {
        context = context.with_owner(owner.clone());
    }
    if args.host {
        context = context.with_role(Role::Host);
    }

    let lobby = LobbySession::join_or_else(connection.clone(), context, token.clone(), |e| {
        error!("Could not join the lobby: {}", e);
    });

    let mut state = lobby.state();
    let mut readied = false;
    let mut chatted = false;
    let mut started = false;

    let exit = loop {
        let snapshot = state.borrow_and_update().clone();
        info!(
            "[LOBBY] {:?}, {} participants, {} ready, role {:?}",
            snapshot.phase,
            snapshot.participants.len(),
            snapshot.ready_count(),
            snapshot.role,
        );

        let synced = snapshot.phase == LobbyPhase::Synced;
        if synced && args.ready && !readied && !snapshot.is_host() {
            readied = true;
            if let Err(e) = lobby.set_ready(true) {
                warn!("[LOBBY] {}", e);
            }
        }
        if synced && !chatted {
            if let Some(text) = &args.chat {
                chatted = true;
                if let Err(e) = lobby.send_chat(text) {
                    warn!("[LOBBY] {}", e);
                }
            }
        }
        if synced && !started {
            if let Some(seconds) = args.start {
                if snapshot.check_can_start().is_ok() {
                    started = true;
                    lobby.start_countdown(seconds)?;
                }
            }
        }

        tokio::select! {
            exit = lobby.finished() => break Some(exit),
            changed = state.changed() => {
                if changed.is_err() {
                    break Some(LobbyExit::ConnectionLost);
                }
            }
            _ = tokio::signal::ctrl_c() => break None,
        }
    };
    let Some(exit) = exit else {
        lobby.leave();
        return Ok(());
    };

    match exit {
        LobbyExit::BattleStarted { question } => {
            let question = question.map(|q| q.to_string()).unwrap_or_default();
            info!("[LOBBY] Battle started: {}", question);
            drop(lobby);
            connection.disconnect();
            let cache = args.cache.open().await?;
            run_battle(connection, token, room, cache).await
        }
        LobbyExit::RoomClosed { message } => {
            info!("[LOBBY] Room closed: {}", message.unwrap_or_default());
            lobby.connection().disconnect();
            Ok(())
        }
        LobbyExit::Kicked => {
            warn!("[LOBBY] Kicked from {}", room);
            Ok(())
        }
        LobbyExit::ConnectionLost => bail!("lost the lobby connection"),
    }
}

async fn run_battle(
    connection: Connection,
    token: String,
    room: RoomId,
    cache: Arc<dyn CountdownCache>,
) -> Result<()> {
    let battle = BattleSession::join_or_else(connection, room, token, cache, |e| {
        error!("Could not join the battle: {}", e);
    });
    let mut state = battle.state();
    let mut last_remaining = None;
    let mut last_board = 0;

    let exit = loop {
        {
            let snapshot = state.borrow_and_update();
            if snapshot.remaining() != last_remaining {
                last_remaining = snapshot.remaining();
                if let Some(seconds) = last_remaining {
                    info!("[BATTLE] {:02}:{:02} remaining", seconds / 60, seconds % 60);
                }
            }
            if snapshot.leaderboard.len() != last_board {
                last_board = snapshot.leaderboard.len();
                log_board("[BATTLE] Leaderboard", &snapshot.leaderboard);
            }
        }
        tokio::select! {
            exit = battle.finished() => break Some(exit),
            changed = state.changed() => {
                if changed.is_err() {
                    break Some(BattleExit::ConnectionLost);
                }
            }
            _ = tokio::signal::ctrl_c() => break None,
        }
    };
    let Some(exit) = exit else {
        battle.leave();
        return Ok(());
    };

    match exit {
        BattleExit::Completed { winners, room_capacity } => {
            log_board("[BATTLE] Winners", &winners);
            if let Some(capacity) = room_capacity {
                info!("[BATTLE] {} of {} finished", winners.len(), capacity);
            }
            battle.leave();
            Ok(())
        }
        BattleExit::ConnectionLost => bail!("lost the battle connection"),
    }
}

fn log_board(title: &str, entries: &[LeaderboardEntry]) {
    info!("{}", title);
    for entry in entries {
        info!("  #{} {} ({:.1}s)", entry.position, entry.username, entry.completion_time);
    }
}
