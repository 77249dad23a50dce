//! Per-connection session layer: chunked upload/download task multiplexing,
//! upstream fan-in/fan-out, and the remote-push queue.
//!
//! This is pure logic -- no sockets, no async. Handlers take the mutable
//! [`CacheDb`] plus whatever arrived off the wire and push side effects (replies
//! to specific client channels, requests to send upstream) onto an [`Effects`]
//! accumulator. The owning actor (see [`crate::server_actor`]) is the only
//! thing that ever turns those effects into real I/O.

use std::collections::{HashMap, VecDeque};

use crate::cache_db::CacheDb;
use crate::chunking;
use crate::fingerprint::Fingerprint;
use crate::protocol::ServerFrame;
use crate::value::CachedItemValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

#[derive(Debug, Clone)]
pub enum UpstreamRequest {
    GetChunk {
        key: Fingerprint,
        chunk_idx: u32,
    },
    AddChunk {
        key: Fingerprint,
        data_size: u64,
        num_chunks: u32,
        chunk_idx: u32,
        chunk_bytes: Vec<u8>,
    },
    WarmUp {
        key: Fingerprint,
    },
}

#[derive(Debug, Default)]
pub struct Effects {
    pub to_clients: Vec<(ChannelId, ServerFrame)>,
    pub to_upstream: Vec<UpstreamRequest>,
}

impl Effects {
    fn reply(&mut self, chan: ChannelId, frame: ServerFrame) {
        self.to_clients.push((chan, frame));
    }

    fn upstream(&mut self, req: UpstreamRequest) {
        self.to_upstream.push(req);
    }
}

#[derive(Debug, Default)]
struct AddTask {
    buffer: Vec<u8>,
    bytes_overall: u64,
    bytes_received: u64,
    chunks_overall: u32,
    chunks_received: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GetTaskStatus {
    Ready,
    WaitingNextChunk,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClientWait {
    waiting_chunk: u32,
    last_chunk_was_sent: bool,
}

#[derive(Debug)]
struct GetTask {
    buffer: Vec<u8>,
    bytes_overall: u64,
    bytes_ready: u64,
    chunks_overall: u32,
    chunks_ready: u32,
    status: GetTaskStatus,
    clients: HashMap<ChannelId, ClientWait>,
}

#[derive(Debug)]
struct RemoteAddTask {
    key: Fingerprint,
    buffer: Vec<u8>,
    bytes_overall: u64,
    chunks_overall: u32,
    chunks_sent: u32,
}

pub struct ServerLogics {
    server_id: String,
    max_storage_size: u64,
    upstream_connected: bool,
    has_incoming_requests_recently: bool,
    add_tasks: HashMap<(ChannelId, Fingerprint), AddTask>,
    get_tasks: HashMap<Fingerprint, GetTask>,
    remote_add_queue: VecDeque<RemoteAddTask>,
    warmup_batch: Vec<Fingerprint>,
}

impl ServerLogics {
    pub fn new(server_id: String, max_storage_size: u64) -> Self {
        Self {
            server_id,
            max_storage_size,
            upstream_connected: false,
            has_incoming_requests_recently: false,
            add_tasks: HashMap::new(),
            get_tasks: HashMap::new(),
            remote_add_queue: VecDeque::new(),
            warmup_batch: Vec::new(),
        }
    }

    pub fn set_max_storage_size(&mut self, max_storage_size: u64) {
        self.max_storage_size = max_storage_size;
    }

    pub fn pending_add_tasks(&self) -> usize {
        self.add_tasks.len()
    }

    pub fn pending_get_tasks(&self) -> usize {
        self.get_tasks.len()
    }

    pub fn pending_remote_add_tasks(&self) -> usize {
        self.remote_add_queue.len()
    }

    /// Client upload: `AddChunk(key, dataSize, numChunks, chunkIdx, bytes)`.
    pub fn on_add_chunk(
        &mut self,
        cache: &mut CacheDb,
        chan: ChannelId,
        key: Fingerprint,
        data_size: u64,
        num_chunks: u32,
        chunk_idx: u32,
        chunk_bytes: Vec<u8>,
        effects: &mut Effects,
    ) {
        self.has_incoming_requests_recently = true;
        let task_key = (chan, key);

        if chunk_idx == 0 {
            let totals_already_set = self
                .add_tasks
                .get(&task_key)
                .map(|t| t.bytes_overall != 0 || t.chunks_overall != 0)
                .unwrap_or(false);

            if data_size == 0 || num_chunks == 0 || totals_already_set {
                self.add_tasks.remove(&task_key);
                effects.reply(chan, ServerFrame::Added { key, ok: false });
                return;
            }
            if data_size > self.max_storage_size {
                self.add_tasks.remove(&task_key);
                tracing::warn!(
                    "rejecting upload of {} ({} bytes exceeds {} byte budget)",
                    key,
                    data_size,
                    self.max_storage_size
                );
                effects.reply(chan, ServerFrame::Added { key, ok: false });
                return;
            }
            let task = self.add_tasks.entry(task_key).or_insert_with(AddTask::default);
            task.bytes_overall = data_size;
            task.chunks_overall = num_chunks;
        }

        let task = match self.add_tasks.get_mut(&task_key) {
            Some(t) => t,
            None => {
                tracing::warn!("chunk {} for {} with no open upload task", chunk_idx, key);
                effects.reply(chan, ServerFrame::Added { key, ok: false });
                return;
            }
        };

        if task.chunks_received != chunk_idx {
            tracing::warn!(
                "out-of-order chunk {} for {} (expected {})",
                chunk_idx,
                key,
                task.chunks_received
            );
            self.add_tasks.remove(&task_key);
            effects.reply(chan, ServerFrame::Added { key, ok: false });
            return;
        }

        task.buffer.extend_from_slice(&chunk_bytes);
        task.bytes_received += chunk_bytes.len() as u64;
        task.chunks_received += 1;

        if task.chunks_received != task.chunks_overall {
            effects.reply(chan, ServerFrame::Added { key, ok: true });
            return;
        }

        let task = self.add_tasks.remove(&task_key).unwrap();
        if task.bytes_received != task.bytes_overall {
            tracing::warn!("byte count mismatch finishing upload of {}", key);
            effects.reply(chan, ServerFrame::Added { key, ok: false });
            return;
        }

        let mut value = match CachedItemValue::deserialize_wire(&task.buffer) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                tracing::warn!("discarding invalid or empty upload of {}", key);
                effects.reply(chan, ServerFrame::Added { key, ok: false });
                return;
            }
        };

        value.description_mut().append_adding(&self.server_id);

        if value.size() > self.max_storage_size {
            tracing::warn!(
                "dropping {} ({} bytes exceeds budget after assembly)",
                key,
                value.size()
            );
            effects.reply(chan, ServerFrame::Added { key, ok: false });
            return;
        }

        if let Err(e) = cache.insert(key, value) {
            tracing::error!("failed to insert {}: {}", key, e);
            effects.reply(chan, ServerFrame::Added { key, ok: false });
            return;
        }

        self.enqueue_remote_add(cache, key);
        effects.reply(chan, ServerFrame::Added { key, ok: true });
    }

    fn enqueue_remote_add(&mut self, cache: &mut CacheDb, key: Fingerprint) {
        let entry = match cache.get(&key) {
            Some(e) => e,
            None => return,
        };
        let buffer = match entry.value.serialize_wire() {
            Ok(b) => b,
            Err(_) => return,
        };
        let bytes_overall = buffer.len() as u64;
        let chunks_overall = chunking::num_chunks(bytes_overall);
        self.remote_add_queue.push_back(RemoteAddTask {
            key,
            buffer,
            bytes_overall,
            chunks_overall,
            chunks_sent: 0,
        });
    }

    /// Client download request: `GetChunk(key, chunkIdx)`.
    pub fn on_chunk_requested(
        &mut self,
        cache: &mut CacheDb,
        chan: ChannelId,
        key: Fingerprint,
        chunk_idx: u32,
        effects: &mut Effects,
    ) {
        self.has_incoming_requests_recently = true;

        if !self.get_tasks.contains_key(&key) {
            if let Some(entry) = cache.get(&key) {
                let mut value = entry.value.clone();
                value.description_mut().append_receiving(&self.server_id);
                match value.serialize_wire() {
                    Ok(buffer) => {
                        let bytes_overall = buffer.len() as u64;
                        let chunks_overall = chunking::num_chunks(bytes_overall);
                        self.get_tasks.insert(
                            key,
                            GetTask {
                                buffer,
                                bytes_overall,
                                bytes_ready: bytes_overall,
                                chunks_overall,
                                chunks_ready: chunks_overall,
                                status: GetTaskStatus::Ready,
                                clients: HashMap::new(),
                            },
                        );
                    }
                    Err(_) => {
                        effects.reply(chan, ServerFrame::empty_chunk(key));
                        return;
                    }
                }
            } else if self.upstream_connected {
                self.get_tasks.insert(
                    key,
                    GetTask {
                        buffer: Vec::new(),
                        bytes_overall: 0,
                        bytes_ready: 0,
                        chunks_overall: 0,
                        chunks_ready: 0,
                        status: GetTaskStatus::WaitingNextChunk,
                        clients: HashMap::new(),
                    },
                );
                effects.upstream(UpstreamRequest::GetChunk { key, chunk_idx: 0 });
            } else {
                effects.reply(chan, ServerFrame::empty_chunk(key));
                return;
            }
        }

        let task = self.get_tasks.get_mut(&key).unwrap();
        if task.status == GetTaskStatus::Ready && chunk_idx < task.chunks_ready {
            let bytes = chunking::chunk(&task.buffer, chunk_idx).to_vec();
            effects.reply(
                chan,
                ServerFrame::Chunk {
                    key,
                    data_size: task.bytes_overall,
                    num_chunks: task.chunks_overall,
                    chunk_idx,
                    chunk_bytes: bytes,
                },
            );
            let is_last = chunk_idx + 1 == task.chunks_overall;
            let client = task.clients.entry(chan).or_insert_with(ClientWait::default);
            client.waiting_chunk = chunk_idx;
            client.last_chunk_was_sent = is_last;

            if !task.clients.is_empty() && task.clients.values().all(|c| c.last_chunk_was_sent) {
                self.get_tasks.remove(&key);
            }
        } else {
            task.clients.insert(
                chan,
                ClientWait {
                    waiting_chunk: chunk_idx,
                    last_chunk_was_sent: false,
                },
            );
        }
    }

    /// A chunk streamed back from upstream for a pending local `GetTask`.
    pub fn on_received_from_cache(
        &mut self,
        cache: &mut CacheDb,
        key: Fingerprint,
        data_size: u64,
        num_chunks: u32,
        chunk_idx: u32,
        chunk_bytes: Vec<u8>,
        effects: &mut Effects,
    ) {
        let is_empty_reply = data_size == 0 && num_chunks == 0 && chunk_idx == 0 && chunk_bytes.is_empty();
        if is_empty_reply {
            self.cancel_get_task_with_empty_reply(key, effects);
            return;
        }

        let task = match self.get_tasks.get_mut(&key) {
            Some(t) => t,
            None => return,
        };

        if task.status != GetTaskStatus::WaitingNextChunk || chunk_idx != task.chunks_ready {
            tracing::warn!("unexpected upstream chunk {} for {}", chunk_idx, key);
            self.cancel_get_task_with_empty_reply(key, effects);
            return;
        }

        if task.chunks_ready == 0 {
            task.bytes_overall = data_size;
            task.chunks_overall = num_chunks;
        }

        task.buffer.extend_from_slice(&chunk_bytes);
        task.bytes_ready += chunk_bytes.len() as u64;
        task.chunks_ready += 1;
        let is_last = task.chunks_ready == task.chunks_overall;
        if is_last {
            task.status = GetTaskStatus::Ready;
        } else {
            effects.upstream(UpstreamRequest::GetChunk {
                key,
                chunk_idx: task.chunks_ready,
            });
        }

        let bytes = chunking::chunk(&task.buffer, chunk_idx).to_vec();
        let data_size_total = task.bytes_overall;
        let chunks_overall = task.chunks_overall;
        let waiting: Vec<ChannelId> = task
            .clients
            .iter()
            .filter(|(_, c)| c.waiting_chunk == chunk_idx && !c.last_chunk_was_sent)
            .map(|(chan, _)| *chan)
            .collect();

        for chan in &waiting {
            effects.reply(
                *chan,
                ServerFrame::Chunk {
                    key,
                    data_size: data_size_total,
                    num_chunks: chunks_overall,
                    chunk_idx,
                    chunk_bytes: bytes.clone(),
                },
            );
        }

        if let Some(task) = self.get_tasks.get_mut(&key) {
            for chan in &waiting {
                if is_last {
                    if let Some(client) = task.clients.get_mut(chan) {
                        client.last_chunk_was_sent = true;
                    }
                } else {
                    task.clients.remove(chan);
                }
            }
        }

        if is_last {
            self.finish_get_task_from_upstream(cache, key, effects);
        }
    }

    fn finish_get_task_from_upstream(&mut self, cache: &mut CacheDb, key: Fingerprint, effects: &mut Effects) {
        let task = match self.get_tasks.get(&key) {
            Some(t) => t,
            None => return,
        };
        if task.bytes_ready != task.bytes_overall {
            tracing::warn!("byte mismatch reassembling {} from upstream", key);
            self.cancel_get_task_with_empty_reply(key, effects);
            return;
        }

        let value = match CachedItemValue::deserialize_wire(&task.buffer) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                tracing::warn!("discarding invalid value for {} reassembled from upstream", key);
                self.cancel_get_task_with_empty_reply(key, effects);
                return;
            }
        };

        if let Err(e) = cache.insert(key, value) {
            tracing::error!("failed to insert {} fetched from upstream: {}", key, e);
        }

        if let Some(task) = self.get_tasks.get(&key) {
            if task.clients.values().all(|c| c.last_chunk_was_sent) {
                self.get_tasks.remove(&key);
            }
        }
    }

    fn cancel_get_task_with_empty_reply(&mut self, key: Fingerprint, effects: &mut Effects) {
        if let Some(task) = self.get_tasks.remove(&key) {
            for chan in task.clients.keys() {
                effects.reply(*chan, ServerFrame::empty_chunk(key));
            }
        }
    }

    /// Reply to our own push upstream: `OnAddedToCache(key, ok)`.
    pub fn on_added_to_cache(&mut self, key: Fingerprint, ok: bool, effects: &mut Effects) {
        let is_active = matches!(self.remote_add_queue.front(), Some(t) if t.key == key);
        if !is_active {
            return;
        }

        if !ok {
            tracing::warn!("upstream rejected push of {}", key);
            self.remote_add_queue.pop_front();
            self.start_next_remote_add(effects);
            return;
        }

        let task = self.remote_add_queue.front_mut().unwrap();
        task.chunks_sent += 1;
        if task.chunks_sent >= task.chunks_overall {
            self.remote_add_queue.pop_front();
            self.start_next_remote_add(effects);
        } else {
            self.send_next_remote_chunk(effects);
        }
    }

    fn send_next_remote_chunk(&mut self, effects: &mut Effects) {
        if let Some(task) = self.remote_add_queue.front() {
            let idx = task.chunks_sent;
            let bytes = chunking::chunk(&task.buffer, idx).to_vec();
            effects.upstream(UpstreamRequest::AddChunk {
                key: task.key,
                data_size: task.bytes_overall,
                num_chunks: task.chunks_overall,
                chunk_idx: idx,
                chunk_bytes: bytes,
            });
        }
    }

    fn start_next_remote_add(&mut self, effects: &mut Effects) {
        if !self.remote_add_queue.is_empty() {
            self.send_next_remote_chunk(effects);
        }
    }

    /// Drive the head of the remote-add queue one step: kicks off the first
    /// chunk of a freshly active task. Later chunks are driven purely by
    /// `on_added_to_cache` replies, so at most one is ever in flight.
    fn drive_remote_add_queue(&mut self, effects: &mut Effects) {
        if !self.upstream_connected {
            return;
        }
        if let Some(task) = self.remote_add_queue.front() {
            if task.chunks_sent == 0 {
                self.send_next_remote_chunk(effects);
            }
        }
    }

    pub fn warm_up(&mut self, key: Fingerprint) {
        self.warmup_batch.push(key);
    }

    fn flush_warmup(&mut self, effects: &mut Effects) {
        for key in self.warmup_batch.drain(..) {
            effects.upstream(UpstreamRequest::WarmUp { key });
        }
    }

    pub fn on_remove(&mut self, cache: &mut CacheDb, chan: ChannelId, key: Fingerprint, effects: &mut Effects) {
        self.has_incoming_requests_recently = true;
        let ok = cache.remove(&key);
        effects.reply(chan, ServerFrame::Removed { key, ok });
    }

    pub fn on_clear(&mut self, cache: &mut CacheDb, chan: ChannelId, effects: &mut Effects) {
        self.has_incoming_requests_recently = true;
        cache.clear_storage();
        effects.reply(chan, ServerFrame::Cleared { ok: true });
    }

    pub fn on_status_request(&mut self, cache: &CacheDb, chan: ChannelId, effects: &mut Effects) {
        self.has_incoming_requests_recently = true;
        effects.reply(
            chan,
            ServerFrame::Status {
                occupied_size: cache.occupied_size(),
                max_size: cache.storage_size(),
                item_count: cache.item_count() as u64,
            },
        );
    }

    /// A client channel dropped: purge every task entry that holds it.
    pub fn on_client_disconnected(&mut self, chan: ChannelId) {
        self.add_tasks.retain(|(c, _), _| *c != chan);
        let mut emptied = Vec::new();
        for (key, task) in self.get_tasks.iter_mut() {
            task.clients.remove(&chan);
            if task.clients.is_empty() && task.status == GetTaskStatus::Ready {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.get_tasks.remove(&key);
        }
    }

    pub fn on_upstream_connected(&mut self) {
        self.upstream_connected = true;
    }

    /// Upstream dropped: cancel every non-ready `GetTask` with an empty reply
    /// and purge the remote-add queue (I9: nothing stays "in flight" to a
    /// peer that's gone).
    pub fn on_upstream_disconnected(&mut self, effects: &mut Effects) {
        self.upstream_connected = false;
        let pending: Vec<Fingerprint> = self
            .get_tasks
            .iter()
            .filter(|(_, t)| t.status != GetTaskStatus::Ready)
            .map(|(k, _)| *k)
            .collect();
        for key in pending {
            self.cancel_get_task_with_empty_reply(key, effects);
        }
        self.remote_add_queue.clear();
    }

    /// Lazy tick (500 ms): warmup + remote-add progress while idle.
    pub fn tick_lazy(&mut self, effects: &mut Effects) {
        if self.upstream_connected && !self.has_incoming_requests_recently {
            self.flush_warmup(effects);
            self.drive_remote_add_queue(effects);
        }
        self.has_incoming_requests_recently = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::value::{BlobRecord, Description};
    use std::sync::Arc;

    fn new_cache() -> (CacheDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheDb::new(Arc::new(ManualClock::new(0)));
        cache
            .update_settings(dir.path().to_path_buf(), 1024 * 1024, 8, 0)
            .unwrap();
        (cache, dir)
    }

    fn wire_bytes(payload: &[u8]) -> Vec<u8> {
        CachedItemValue::new(
            vec![BlobRecord {
                name: "payload".into(),
                data: payload.to_vec(),
            }],
            Description::default(),
        )
        .unwrap()
        .serialize_wire()
        .unwrap()
    }

    #[test]
    fn chunked_upload_of_200kib_value_reassembles_and_commits() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);

        let payload = vec![0x42u8; 200 * 1024];
        let wire = wire_bytes(&payload);
        let key = Fingerprint::of(&wire);
        let total = wire.len() as u64;
        let n = chunking::num_chunks(total);
        assert_eq!(n, 4);

        for idx in 0..n {
            let mut effects = Effects::default();
            let bytes = chunking::chunk(&wire, idx).to_vec();
            logics.on_add_chunk(&mut cache, chan, key, total, n, idx, bytes, &mut effects);
            assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Added { key, ok: true })]);
        }

        assert_eq!(logics.pending_add_tasks(), 0);
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.value.blobs().unwrap()[0].data, payload);
    }

    #[test]
    fn out_of_order_chunk_cancels_the_upload() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);
        let key = Fingerprint::of(b"x");

        let mut effects = Effects::default();
        logics.on_add_chunk(&mut cache, chan, key, 150, 3, 0, vec![1; 50], &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Added { key, ok: true })]);

        // Skip index 1, jump straight to index 2: the task must be cancelled.
        let mut effects = Effects::default();
        logics.on_add_chunk(&mut cache, chan, key, 150, 3, 2, vec![1; 50], &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Added { key, ok: false })]);
        assert_eq!(logics.pending_add_tasks(), 0);

        // The task is gone; a stray late chunk finds nothing to attach to.
        let mut effects = Effects::default();
        logics.on_add_chunk(&mut cache, chan, key, 150, 3, 1, vec![1; 50], &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Added { key, ok: false })]);
    }

    #[test]
    fn local_hit_serves_all_chunks_to_a_single_client() {
        let (mut cache, _dir) = new_cache();
        let key = Fingerprint::of(b"k");
        let value = CachedItemValue::new(
            vec![BlobRecord {
                name: "p".into(),
                data: vec![7u8; 10],
            }],
            Description::default(),
        )
        .unwrap();
        cache.insert(key, value).unwrap();

        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);
        let mut effects = Effects::default();
        logics.on_chunk_requested(&mut cache, chan, key, 0, &mut effects);

        assert_eq!(effects.to_clients.len(), 1);
        match &effects.to_clients[0].1 {
            ServerFrame::Chunk { chunk_idx: 0, num_chunks: 1, .. } => {}
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(logics.pending_get_tasks(), 0, "single-chunk value should fully drain the task");
    }

    #[test]
    fn miss_without_upstream_replies_empty_chunk() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);
        let key = Fingerprint::of(b"missing");

        let mut effects = Effects::default();
        logics.on_chunk_requested(&mut cache, chan, key, 0, &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::empty_chunk(key))]);
        assert_eq!(logics.pending_get_tasks(), 0);
    }

    #[test]
    fn two_clients_fan_out_from_one_upstream_request_and_disconnect_cancels_both() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        logics.on_upstream_connected();
        let key = Fingerprint::of(b"remote-key");
        let a = ChannelId(1);
        let b = ChannelId(2);

        let mut effects = Effects::default();
        logics.on_chunk_requested(&mut cache, a, key, 0, &mut effects);
        assert!(matches!(effects.to_upstream.as_slice(), [UpstreamRequest::GetChunk { chunk_idx: 0, .. }]));

        let mut effects = Effects::default();
        logics.on_chunk_requested(&mut cache, b, key, 0, &mut effects);
        assert!(
            effects.to_upstream.is_empty(),
            "a second waiter must not trigger a second upstream request"
        );

        let wire = wire_bytes(&vec![9u8; 5 * chunking::CHUNK_SIZE]);
        let total = wire.len() as u64;
        let n = chunking::num_chunks(total);
        assert_eq!(n, 5);

        // Chunks 0..=2 arrive; each client re-polls for the next index right
        // after being served the previous one, mirroring a real client's loop.
        for idx in 0..3u32 {
            let mut effects = Effects::default();
            logics.on_received_from_cache(
                &mut cache,
                key,
                total,
                n,
                idx,
                chunking::chunk(&wire, idx).to_vec(),
                &mut effects,
            );
            assert_eq!(effects.to_clients.len(), 2, "both waiters should get chunk {}", idx);

            let mut effects = Effects::default();
            logics.on_chunk_requested(&mut cache, a, key, idx + 1, &mut effects);
            logics.on_chunk_requested(&mut cache, b, key, idx + 1, &mut effects);
            assert!(effects.to_upstream.is_empty(), "re-polling must not re-request upstream");
        }

        // Upstream vanishes after chunk 2 of 5, with both clients now waiting
        // on chunk 3: each gets a single empty-chunk reply.
        let mut effects = Effects::default();
        logics.on_upstream_disconnected(&mut effects);
        let mut channels: Vec<ChannelId> = effects.to_clients.iter().map(|(chan, _)| *chan).collect();
        channels.sort();
        assert_eq!(channels, vec![a, b]);
        assert!(effects.to_clients.iter().all(|(_, frame)| frame.is_empty_chunk()));
        assert_eq!(logics.pending_get_tasks(), 0);
        assert!(cache.get(&key).is_none(), "partial value must never be inserted");
    }

    #[test]
    fn client_disconnect_purges_its_add_tasks() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);
        let key = Fingerprint::of(b"partial");

        let mut effects = Effects::default();
        logics.on_add_chunk(&mut cache, chan, key, 100, 2, 0, vec![1; 50], &mut effects);
        assert_eq!(logics.pending_add_tasks(), 1);

        logics.on_client_disconnected(chan);
        assert_eq!(logics.pending_add_tasks(), 0);
    }

    #[test]
    fn remove_and_clear_reply_synchronously() {
        let (mut cache, _dir) = new_cache();
        let key = Fingerprint::of(b"k");
        cache
            .insert(
                key,
                CachedItemValue::new(
                    vec![BlobRecord {
                        name: "p".into(),
                        data: vec![1, 2, 3],
                    }],
                    Description::default(),
                )
                .unwrap(),
            )
            .unwrap();

        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        let chan = ChannelId(1);

        let mut effects = Effects::default();
        logics.on_remove(&mut cache, chan, key, &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Removed { key, ok: true })]);

        let mut effects = Effects::default();
        logics.on_clear(&mut cache, chan, &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Cleared { ok: true })]);
    }

    #[test]
    fn oversized_upload_is_rejected_at_chunk_zero() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 10);
        let chan = ChannelId(1);
        let key = Fingerprint::of(b"too-big");

        let mut effects = Effects::default();
        logics.on_add_chunk(&mut cache, chan, key, 1000, 1, 0, vec![0; 10], &mut effects);
        assert_eq!(effects.to_clients, vec![(chan, ServerFrame::Added { key, ok: false })]);
        assert_eq!(logics.pending_add_tasks(), 0);
    }

    #[test]
    fn remote_add_queue_drains_one_task_at_a_time() {
        let (mut cache, _dir) = new_cache();
        let mut logics = ServerLogics::new("server-a".into(), 1024 * 1024);
        logics.on_upstream_connected();
        let chan = ChannelId(1);

        for i in 0u8..2 {
            let key = Fingerprint::of(&[i]);
            let wire = wire_bytes(&[i; 10]);
            let total = wire.len() as u64;
            let mut effects = Effects::default();
            logics.on_add_chunk(&mut cache, chan, key, total, 1, 0, wire, &mut effects);
        }
        assert_eq!(logics.pending_remote_add_tasks(), 2);

        // First tick after traffic only clears the busy flag (spec: lazy work
        // is skipped while `hasIncomingRequestsRecently` is still true).
        let mut effects = Effects::default();
        logics.tick_lazy(&mut effects);
        assert!(effects.to_upstream.is_empty());

        let mut effects = Effects::default();
        logics.tick_lazy(&mut effects);
        assert_eq!(effects.to_upstream.len(), 1, "only the head task's first chunk should be pushed");
    }
}
