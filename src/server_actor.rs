//! Ties the protocol endpoints (C4/C5), the session layer (C6), the remote
//! controller (C7), the shared-directory client (C8) and the CacheDb
//! autosave driver (C9) into one cooperative event loop.
//!
//! Socket I/O lives in small per-connection tasks that only move frames
//! across channels, and every decision -- updating a task map, touching the
//! cache, advancing the remote state machine -- happens on a single task
//! that owns all of it and never awaits while holding that state. This is
//! what §5 calls "a separate worker may own socket I/O and marshal
//! completed frames back to the loop via a queue".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::cache_db::CacheDb;
use crate::clock::Clock;
use crate::config::{Config, CustomServer, EnabledRemote};
use crate::logging;
use crate::protocol::{ClientFrame, ClientSideCodec, ServerFrame, ServerSideCodec};
use crate::remote_controller::{RemoteController, RemoteControllerEffect, RemoteState};
use crate::server_logics::{ChannelId, Effects, ServerLogics, UpstreamRequest};
use crate::shared_directory::{self, PoolEntry, SharedDirectoryClient, SharedServerEntry};

/// Events the actor loop reacts to. Every socket, timer, and directory fetch
/// in this module exists only to produce one of these and send it down
/// `event_tx`; nothing outside `run_loop` touches `CacheDb`, `ServerLogics`,
/// or `RemoteController` directly.
enum ActorEvent {
    ClientConnected { chan: ChannelId, sink: mpsc::UnboundedSender<ServerFrame> },
    ClientFrame { chan: ChannelId, frame: ClientFrame },
    ClientDisconnected { chan: ChannelId },
    UpstreamChannelOpen { generation: u64, sink: mpsc::UnboundedSender<ClientFrame> },
    UpstreamChannelProblem { generation: u64 },
    UpstreamFrame { generation: u64, frame: ServerFrame },
    FastTick,
    LazyTick,
    SharedDirectoryRefreshed { pools: Vec<PoolEntry>, servers: Vec<SharedServerEntry> },
}

/// The whole server, wired up and ready to [`run`](CacheServer::run).
pub struct CacheServer {
    config: Config,
    clock: Arc<dyn Clock>,
}

impl CacheServer {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Bind the listen port, start every periodic driver, and run the
    /// cooperative event loop until the listener dies. Never returns on the
    /// happy path.
    pub async fn run(self) -> crate::error::CacheServerResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.network.listen_port)).await?;
        tracing::info!("listening on {}", listener.local_addr()?);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ActorEvent>();

        spawn_accept_loop(listener, event_tx.clone());
        spawn_tick_loop(event_tx.clone());
        if self.config.shared_directory.base_url.is_some() {
            spawn_shared_directory_loop(self.config.clone(), event_tx.clone());
        }

        let mut cache = CacheDb::new(self.clock.clone());
        cache.update_settings(
            self.config.storage.folder.clone(),
            self.config.storage.max_storage_size_bytes,
            self.config.storage.max_items_in_memory,
            self.config.storage.auto_save_timeout_ms,
        )?;

        let mut logics = ServerLogics::new(
            self.config.shared_directory.own_server_name.clone(),
            self.config.storage.max_storage_size_bytes,
        );
        let mut remote = RemoteController::new(
            self.clock.clone(),
            self.config.connect_timeout(),
            self.config.reattempt_wait(),
        );

        let mut client_sinks: HashMap<ChannelId, mpsc::UnboundedSender<ServerFrame>> = HashMap::new();
        let mut upstream_sink: Option<mpsc::UnboundedSender<ClientFrame>> = None;
        let mut upstream_generation: u64 = 0;
        let mut pools: Vec<PoolEntry> = Vec::new();
        let mut pool_servers: Vec<SharedServerEntry> = Vec::new();

        let initial_candidates = build_candidates(&self.config, &pools, &pool_servers);
        if !initial_candidates.is_empty() {
            let effects = remote.start(initial_candidates);
            apply_remote_effects(effects, &mut upstream_generation, event_tx.clone());
        }

        while let Some(event) = event_rx.recv().await {
            match event {
                ActorEvent::ClientConnected { chan, sink } => {
                    logging::log_network_event("client_connected", &chan.0.to_string());
                    client_sinks.insert(chan, sink);
                }
                ActorEvent::ClientFrame { chan, frame } => {
                    let mut effects = Effects::default();
                    dispatch_client_frame(&mut logics, &mut cache, chan, frame, &mut effects);
                    apply_effects(effects, &client_sinks, &upstream_sink);
                }
                ActorEvent::ClientDisconnected { chan } => {
                    logging::log_network_event("client_disconnected", &chan.0.to_string());
                    logics.on_client_disconnected(chan);
                    client_sinks.remove(&chan);
                }
                ActorEvent::UpstreamFrame { generation, frame } => {
                    if generation != upstream_generation {
                        continue;
                    }
                    let mut effects = Effects::default();
                    dispatch_upstream_frame(&mut logics, &mut cache, &mut remote, frame, &mut effects);
                    apply_effects(effects, &client_sinks, &upstream_sink);
                }
                ActorEvent::UpstreamChannelOpen { generation, sink } => {
                    if generation != upstream_generation {
                        continue;
                    }
                    // The raw TCP channel is open, not yet verified -- `logics`
                    // only learns the upstream is usable once `Status` comes
                    // back and the controller reaches STARTED (see
                    // `dispatch_upstream_frame`).
                    upstream_sink = Some(sink);
                    let effects = remote.on_channel_open();
                    apply_remote_effects_inline(
                        effects,
                        &mut upstream_sink,
                        &mut upstream_generation,
                        event_tx.clone(),
                        &mut logics,
                        &client_sinks,
                    );
                }
                ActorEvent::UpstreamChannelProblem { generation } => {
                    if generation != upstream_generation {
                        continue;
                    }
                    // `on_channel_problem` always yields a `Disconnect` effect
                    // for a live connection (CONNECTING/VERIFYING/STARTED);
                    // `apply_remote_effects_inline` is what clears
                    // `upstream_sink` and notifies `logics`.
                    let remote_effects = remote.on_channel_problem();
                    apply_remote_effects_inline(
                        remote_effects,
                        &mut upstream_sink,
                        &mut upstream_generation,
                        event_tx.clone(),
                        &mut logics,
                        &client_sinks,
                    );
                }
                ActorEvent::FastTick => {
                    if let Err(e) = cache.update() {
                        logging::log_error_with_context("autosave tick", &e);
                    }
                    let remote_effects = remote.tick();
                    apply_remote_effects_inline(
                        remote_effects,
                        &mut upstream_sink,
                        &mut upstream_generation,
                        event_tx.clone(),
                        &mut logics,
                        &client_sinks,
                    );
                }
                ActorEvent::LazyTick => {
                    let mut effects = Effects::default();
                    logics.tick_lazy(&mut effects);
                    apply_effects(effects, &client_sinks, &upstream_sink);
                }
                ActorEvent::SharedDirectoryRefreshed { pools: new_pools, servers } => {
                    pools = new_pools;
                    pool_servers = servers;
                    let candidates = build_candidates(&self.config, &pools, &pool_servers);
                    let remote_effects = remote.update_candidates(candidates);
                    apply_remote_effects_inline(
                        remote_effects,
                        &mut upstream_sink,
                        &mut upstream_generation,
                        event_tx.clone(),
                        &mut logics,
                        &client_sinks,
                    );
                }
            }
        }

        Ok(())
    }
}

fn dispatch_client_frame(
    logics: &mut ServerLogics,
    cache: &mut CacheDb,
    chan: ChannelId,
    frame: ClientFrame,
    effects: &mut Effects,
) {
    match frame {
        ClientFrame::AddChunk { key, data_size, num_chunks, chunk_idx, chunk_bytes } => {
            logics.on_add_chunk(cache, chan, key, data_size, num_chunks, chunk_idx, chunk_bytes, effects);
        }
        ClientFrame::GetChunk { key, chunk_idx } => {
            logics.on_chunk_requested(cache, chan, key, chunk_idx, effects);
        }
        ClientFrame::Remove { key } => logics.on_remove(cache, chan, key, effects),
        ClientFrame::Clear => logics.on_clear(cache, chan, effects),
        ClientFrame::WarmUp { key } => logics.warm_up(key),
        ClientFrame::StatusRequest => logics.on_status_request(cache, chan, effects),
    }
}

fn dispatch_upstream_frame(
    logics: &mut ServerLogics,
    cache: &mut CacheDb,
    remote: &mut RemoteController,
    frame: ServerFrame,
    effects: &mut Effects,
) {
    match frame {
        ServerFrame::Added { key, ok } => logics.on_added_to_cache(key, ok, effects),
        ServerFrame::Chunk { key, data_size, num_chunks, chunk_idx, chunk_bytes } => {
            logics.on_received_from_cache(cache, key, data_size, num_chunks, chunk_idx, chunk_bytes, effects);
        }
        ServerFrame::Status { .. } => {
            remote.on_status_reply();
            if remote.state() == RemoteState::Started {
                logics.on_upstream_connected();
            }
        }
        ServerFrame::Removed { .. } | ServerFrame::Cleared { .. } => {}
    }
}

fn apply_effects(
    effects: Effects,
    client_sinks: &HashMap<ChannelId, mpsc::UnboundedSender<ServerFrame>>,
    upstream_sink: &Option<mpsc::UnboundedSender<ClientFrame>>,
) {
    for (chan, frame) in effects.to_clients {
        if let Some(sink) = client_sinks.get(&chan) {
            let _ = sink.send(frame);
        }
    }
    if let Some(sink) = upstream_sink {
        for request in effects.to_upstream {
            let _ = sink.send(upstream_request_to_frame(request));
        }
    }
}

fn upstream_request_to_frame(request: UpstreamRequest) -> ClientFrame {
    match request {
        UpstreamRequest::GetChunk { key, chunk_idx } => ClientFrame::GetChunk { key, chunk_idx },
        UpstreamRequest::AddChunk { key, data_size, num_chunks, chunk_idx, chunk_bytes } => {
            ClientFrame::AddChunk { key, data_size, num_chunks, chunk_idx, chunk_bytes }
        }
        UpstreamRequest::WarmUp { key } => ClientFrame::WarmUp { key },
    }
}

/// Apply remote-controller effects produced before an upstream connection
/// exists yet (the initial `start()` call): `SendStatusRequest` can't happen
/// this early, so only `Connect` is meaningful.
fn apply_remote_effects(
    effects: Vec<RemoteControllerEffect>,
    generation: &mut u64,
    event_tx: mpsc::UnboundedSender<ActorEvent>,
) {
    for effect in effects {
        if let RemoteControllerEffect::Connect(candidate) = effect {
            *generation += 1;
            spawn_upstream_connect(candidate, *generation, event_tx.clone());
        }
    }
}

/// Apply remote-controller effects once the loop already owns an upstream
/// sink: `Connect` bumps the generation and dials a fresh candidate,
/// `Disconnect` drops the sink (stale events from the old connection are
/// filtered by generation) and tells `logics` the upstream is gone so it
/// cancels/purges whatever was in flight to it, `SendStatusRequest` writes
/// directly through the sink.
fn apply_remote_effects_inline(
    effects: Vec<RemoteControllerEffect>,
    upstream_sink: &mut Option<mpsc::UnboundedSender<ClientFrame>>,
    generation: &mut u64,
    event_tx: mpsc::UnboundedSender<ActorEvent>,
    logics: &mut ServerLogics,
    client_sinks: &HashMap<ChannelId, mpsc::UnboundedSender<ServerFrame>>,
) {
    for effect in effects {
        match effect {
            RemoteControllerEffect::Connect(candidate) => {
                *generation += 1;
                spawn_upstream_connect(candidate, *generation, event_tx.clone());
            }
            RemoteControllerEffect::Disconnect => {
                *generation += 1;
                *upstream_sink = None;
                let mut logic_effects = Effects::default();
                logics.on_upstream_disconnected(&mut logic_effects);
                apply_effects(logic_effects, client_sinks, &None);
            }
            RemoteControllerEffect::SendStatusRequest => {
                if let Some(sink) = upstream_sink.as_ref() {
                    let _ = sink.send(ClientFrame::StatusRequest);
                }
            }
        }
    }
}

/// Candidate list per §4.5: user-configured custom servers first, then
/// (when a pool mode is enabled) whatever the shared directory resolves for
/// that mode against the current pool and server listings. `EnabledRemote::None`
/// means no upstream regardless of what custom servers happen to be configured.
fn build_candidates(config: &Config, pools: &[PoolEntry], servers: &[SharedServerEntry]) -> Vec<CustomServer> {
    if matches!(config.remote.enabled, EnabledRemote::None) {
        return Vec::new();
    }
    let mut candidates = config.remote.custom_servers.clone();
    if matches!(config.remote.enabled, EnabledRemote::Pool { .. } | EnabledRemote::PoolServer { .. }) {
        candidates.extend(shared_directory::candidates_for(&config.remote.enabled, &[], pools, servers));
    }
    candidates
}

fn spawn_accept_loop(listener: TcpListener, event_tx: mpsc::UnboundedSender<ActorEvent>) {
    tokio::spawn(async move {
        let mut next_chan = 0u64;
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    continue;
                }
            };
            next_chan += 1;
            let chan = ChannelId(next_chan);
            tracing::debug!("client {} connected from {}", chan.0, addr);
            spawn_client_connection(socket, chan, event_tx.clone());
        }
    });
}

fn spawn_client_connection(socket: TcpStream, chan: ChannelId, event_tx: mpsc::UnboundedSender<ActorEvent>) {
    let framed = Framed::new(socket, ServerSideCodec::new());
    let (mut sink, mut stream) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let _ = event_tx.send(ActorEvent::ClientConnected { chan, sink: out_tx });

    let writer_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = writer_tx.send(ActorEvent::ClientDisconnected { chan });
    });

    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    if event_tx.send(ActorEvent::ClientFrame { chan, frame }).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("client {} framing error: {}", chan.0, e);
                    break;
                }
                None => break,
            }
        }
        let _ = event_tx.send(ActorEvent::ClientDisconnected { chan });
    });
}

fn spawn_upstream_connect(candidate: CustomServer, generation: u64, event_tx: mpsc::UnboundedSender<ActorEvent>) {
    tokio::spawn(async move {
        let addr = (candidate.ip.as_str(), candidate.port);
        let connect = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr)).await;
        let socket = match connect {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                tracing::warn!("upstream {} unreachable: {}", candidate.name, e);
                let _ = event_tx.send(ActorEvent::UpstreamChannelProblem { generation });
                return;
            }
            Err(_) => {
                tracing::warn!("upstream {} connect attempt timed out", candidate.name);
                let _ = event_tx.send(ActorEvent::UpstreamChannelProblem { generation });
                return;
            }
        };

        let framed = Framed::new(socket, ClientSideCodec::new());
        let (mut sink, mut stream) = framed.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let _ = event_tx.send(ActorEvent::UpstreamChannelOpen { generation, sink: out_tx });

        let writer_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    if event_tx.send(ActorEvent::UpstreamFrame { generation, frame }).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("upstream framing error: {}", e);
                    break;
                }
                None => break,
            }
        }
        let _ = event_tx.send(ActorEvent::UpstreamChannelProblem { generation });
    });
}

/// Two cadences, collapsed into one task: a fast tick drives autosave and
/// the remote-controller timers, a lazy tick every 32nd beat drains warmup
/// and remote-add work while the server is idle.
fn spawn_tick_loop(event_tx: mpsc::UnboundedSender<ActorEvent>) {
    tokio::spawn(async move {
        let mut fast = tokio::time::interval(Duration::from_millis(16));
        let mut beat = 0u32;
        loop {
            fast.tick().await;
            if event_tx.send(ActorEvent::FastTick).is_err() {
                break;
            }
            beat += 1;
            if beat % 32 == 0 {
                if event_tx.send(ActorEvent::LazyTick).is_err() {
                    break;
                }
            }
        }
    });
}

fn spawn_shared_directory_loop(config: Config, event_tx: mpsc::UnboundedSender<ActorEvent>) {
    let base_url = match &config.shared_directory.base_url {
        Some(url) => url.clone(),
        None => return,
    };
    tokio::spawn(async move {
        let client = SharedDirectoryClient::new(base_url);
        let mut interval = tokio::time::interval(config.shared_refresh_interval());
        loop {
            interval.tick().await;
            let pools = match client.fetch_pools().await {
                Ok(pools) => pools,
                Err(e) => {
                    tracing::error!("shared directory pool refresh failed: {}", e);
                    continue;
                }
            };
            match client.fetch_servers().await {
                Ok(servers) => {
                    if event_tx.send(ActorEvent::SharedDirectoryRefreshed { pools, servers }).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("shared directory refresh failed: {}", e),
            }
        }
    });
}
