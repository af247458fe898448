//! In-process stream backend.
//!
//! [`MemoryStore`] holds streams, consumer groups and delay sets behind one
//! `tokio::sync::Mutex`. Each [`MemoryBackend`] is a handle on a store with its
//! own connection state and error slot, so several consumers can share a store
//! the way several clients share a Redis server.
//!
//! Reply semantics follow Redis: `BUSYGROUP` on duplicate groups, `NOGROUP` on
//! reads from a missing group, `XPENDING` ordered by id, `XCLAIM` honoring the
//! minimum idle time and dropping deleted entries, and pending entries whose
//! payload was deleted returned with no fields.
//!
//! The store also records every call and can inject faults, which is what the
//! integration tests rely on.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::{Credentials, HostPort};
use crate::error::{BackendError, BackendResult};

use super::backend::{
    split_delay_member, DialTarget, GroupInfo, PendingEntry, ReadFrom, StreamBackend, StreamEntry,
};

type Id = (u64, u64);

fn parse_id(raw: &str) -> Option<Id> {
    match raw.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((raw.parse().ok()?, 0)),
    }
}

fn format_id(id: Id) -> String {
    format!("{}-{}", id.0, id.1)
}

fn no_group(stream: &str, group: &str) -> BackendError {
    BackendError::Server(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

/// Backend calls, as recorded in the command log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Connect,
    Authenticate,
    SelectDatabase,
    ResolveMaster,
    CreateGroup,
    GroupInfos,
    Append,
    GroupRead,
    PendingSummary,
    Claim,
    Ack,
    Delete,
    EntriesAfter,
    Schedule,
    MoveDue,
    DeleteKeys,
}

/// One recorded backend call and the key (or target) it addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: BackendOp,
    pub key: String,
}

enum Fault {
    /// The call fails with this server error.
    Error(String),
    /// The call returns a falsy result and leaves this text in the error slot.
    Falsy(String),
}

struct PendingState {
    consumer: String,
    delivered_ms: i64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: Id,
    pending: BTreeMap<Id, PendingState>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<Id, BTreeMap<String, Vec<u8>>>,
    last_id: Id,
    groups: BTreeMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: BTreeMap<String, Vec<u8>>, now_ms: i64, max_len: Option<usize>) -> Id {
        let ms = now_ms.max(0) as u64;
        let id = if ms > self.last_id.0 {
            (ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.entries.insert(id, fields);
        self.last_id = id;

        if let Some(max_len) = max_len {
            while self.entries.len() > max_len {
                self.entries.pop_first();
            }
        }
        id
    }
}

#[derive(Default)]
struct Keyspace {
    streams: HashMap<String, StreamState>,
    delayed: HashMap<String, BTreeMap<Vec<u8>, i64>>,
    commands: Vec<Command>,
    auth_calls: Vec<Credentials>,
    dialed: Vec<DialTarget>,
    sentinels_asked: Vec<(HostPort, bool)>,
    selected_db: Option<i64>,
    faults: HashMap<BackendOp, VecDeque<Fault>>,
    stale_error: Option<String>,
    lost_claims: usize,
    sentinels: HashMap<String, HostPort>,
    required_credentials: Option<Credentials>,
}

/// Shared state behind any number of [`MemoryBackend`] handles.
pub struct MemoryStore {
    state: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store driven by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Keyspace::default()),
            clock,
        })
    }

    /// Create an empty store on the system clock.
    pub fn with_system_clock() -> Arc<Self> {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Open a new, unconnected handle on this store.
    pub fn backend(self: &Arc<Self>) -> MemoryBackend {
        MemoryBackend {
            store: Arc::clone(self),
            connected: false,
            authenticated: false,
            last_error: None,
        }
    }

    /// Every call issued so far, in order.
    pub async fn commands(&self) -> Vec<Command> {
        self.state.lock().await.commands.clone()
    }

    /// Number of calls of the given kind.
    pub async fn count(&self, op: BackendOp) -> usize {
        self.state
            .lock()
            .await
            .commands
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    pub async fn clear_commands(&self) {
        self.state.lock().await.commands.clear();
    }

    /// Credentials passed to `authenticate`, in order.
    pub async fn auth_calls(&self) -> Vec<Credentials> {
        self.state.lock().await.auth_calls.clone()
    }

    /// Targets passed to `connect`, in order.
    pub async fn dialed(&self) -> Vec<DialTarget> {
        self.state.lock().await.dialed.clone()
    }

    /// Sentinels asked for a master address, with whether TLS was used.
    pub async fn sentinels_asked(&self) -> Vec<(HostPort, bool)> {
        self.state.lock().await.sentinels_asked.clone()
    }

    pub async fn selected_db(&self) -> Option<i64> {
        self.state.lock().await.selected_db
    }

    /// Make the next call of kind `op` fail with `message`.
    pub async fn fail_next(&self, op: BackendOp, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(Fault::Error(message.into()));
    }

    /// Make the next call of kind `op` return a falsy result, leaving `message` in the error slot.
    pub async fn fail_next_silently(&self, op: BackendOp, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(Fault::Falsy(message.into()));
    }

    /// Leave `message` in the error slot of the next handle that issues a call,
    /// without failing that call.
    pub async fn leave_stale_error(&self, message: impl Into<String>) {
        self.state.lock().await.stale_error = Some(message.into());
    }

    /// Let another consumer win the next claim: the targeted entries are
    /// reassigned to it just before the claim runs.
    pub async fn lose_next_claim(&self) {
        self.state.lock().await.lost_claims += 1;
    }

    /// Register the address sentinels report for `master`.
    pub async fn add_sentinel_master(&self, master: impl Into<String>, address: HostPort) {
        self.state.lock().await.sentinels.insert(master.into(), address);
    }

    /// Refuse every call but `connect` until these credentials are presented.
    pub async fn require_credentials(&self, credentials: Credentials) {
        self.state.lock().await.required_credentials = Some(credentials);
    }

    /// Ids currently stored in `stream`.
    pub async fn stream_ids(&self, stream: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.entries.keys().copied().map(format_id).collect())
            .unwrap_or_default()
    }

    /// Pending entries of `group` as `(id, consumer)` pairs, ordered by id.
    pub async fn pending(&self, stream: &str, group: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (format_id(*id), p.consumer.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of members in the delay set `key`.
    pub async fn delayed_len(&self, key: &str) -> usize {
        self.state
            .lock()
            .await
            .delayed
            .get(key)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state.streams.contains_key(key) || state.delayed.contains_key(key)
    }
}

/// One client handle on a [`MemoryStore`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    connected: bool,
    authenticated: bool,
    last_error: Option<String>,
}

impl MemoryBackend {
    /// Handle on a fresh store of its own.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryStore::new(clock).backend()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Record the call, then apply connection state, auth and injected faults.
    fn enter(&mut self, state: &mut Keyspace, op: BackendOp, key: &str) -> BackendResult<()> {
        state.commands.push(Command {
            op,
            key: key.to_string(),
        });

        if let Some(stale) = state.stale_error.take() {
            self.last_error = Some(stale);
        }

        let exempt = matches!(op, BackendOp::Connect | BackendOp::ResolveMaster);
        if !exempt && !self.connected {
            return Err(BackendError::NotConnected);
        }
        if !exempt
            && op != BackendOp::Authenticate
            && state.required_credentials.is_some()
            && !self.authenticated
        {
            return Err(BackendError::Server(
                "NOAUTH Authentication required.".to_string(),
            ));
        }

        match state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(Fault::Error(message)) => Err(BackendError::Server(message)),
            Some(Fault::Falsy(message)) => {
                self.last_error = Some(message);
                Err(BackendError::Rejected(format!("{:?} returned false", op)))
            }
            None => Ok(()),
        }
    }

    fn now_ms(&self) -> i64 {
        self.store.clock.now_ms()
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn connect(&mut self, target: &DialTarget, _timeout: Option<Duration>) -> BackendResult<()> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Connect, &target.to_string())?;
        state.dialed.push(target.clone());
        self.connected = true;
        self.authenticated = false;

        if let DialTarget::Cluster {
            credentials: Some(credentials),
            ..
        } = target
        {
            state.auth_calls.push(credentials.clone());
            if let Some(expected) = &state.required_credentials {
                if expected != credentials {
                    self.connected = false;
                    return Err(BackendError::Server(
                        "WRONGPASS invalid username-password pair or user is disabled.".to_string(),
                    ));
                }
            }
            self.authenticated = true;
        }
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> BackendResult<()> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Authenticate, "")?;
        state.auth_calls.push(credentials.clone());

        match &state.required_credentials {
            Some(expected) if expected != credentials => Err(BackendError::Server(
                "WRONGPASS invalid username-password pair or user is disabled.".to_string(),
            )),
            _ => {
                self.authenticated = true;
                Ok(())
            }
        }
    }

    async fn select_database(&mut self, index: i64) -> BackendResult<()> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::SelectDatabase, &index.to_string())?;
        state.selected_db = Some(index);
        Ok(())
    }

    async fn resolve_master(
        &mut self,
        sentinels: &[HostPort],
        master: &str,
        tls: bool,
        _timeout: Option<Duration>,
    ) -> BackendResult<Option<HostPort>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::ResolveMaster, master)?;
        let Some(sentinel) = sentinels.first() else {
            return Ok(None);
        };
        state.sentinels_asked.push((sentinel.clone(), tls));
        Ok(state.sentinels.get(master).cloned())
    }

    async fn create_group(&mut self, stream: &str, group: &str) -> BackendResult<()> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::CreateGroup, stream)?;

        let entry = state.streams.entry(stream.to_string()).or_default();
        if entry.groups.contains_key(group) {
            return Err(BackendError::Server(
                "BUSYGROUP Consumer Group name already exists".to_string(),
            ));
        }
        entry.groups.insert(group.to_string(), GroupState::default());
        Ok(())
    }

    async fn group_infos(&mut self, stream: &str) -> BackendResult<Vec<GroupInfo>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::GroupInfos, stream)?;

        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| BackendError::Server("ERR no such key".to_string()))?;

        Ok(stream_state
            .groups
            .iter()
            .map(|(name, group)| GroupInfo {
                name: name.clone(),
                pending: group.pending.len() as u64,
                last_delivered_id: format_id(group.last_delivered),
                lag: Some(
                    stream_state
                        .entries
                        .range((Bound::Excluded(group.last_delivered), Bound::Unbounded))
                        .count() as u64,
                ),
            })
            .collect())
    }

    async fn append(
        &mut self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: Option<usize>,
    ) -> BackendResult<String> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Append, stream)?;

        let now = self.now_ms();
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        let id = state
            .streams
            .entry(stream.to_string())
            .or_default()
            .append(fields, now, max_len);
        Ok(format_id(id))
    }

    async fn group_read(
        &mut self,
        group: &str,
        consumer: &str,
        stream: &str,
        from: ReadFrom,
        count: usize,
        _block: Option<Duration>,
    ) -> BackendResult<Vec<StreamEntry>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::GroupRead, stream)?;

        let now = self.now_ms();
        let StreamState {
            entries, groups, ..
        } = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut out = Vec::new();
        match from {
            ReadFrom::Pending => {
                for (id, pending) in group_state
                    .pending
                    .iter_mut()
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(count)
                {
                    pending.delivered_ms = now;
                    out.push(StreamEntry {
                        id: format_id(*id),
                        fields: entries.get(id).cloned(),
                    });
                }
            }
            ReadFrom::New => {
                let picked: Vec<Id> = entries
                    .range((Bound::Excluded(group_state.last_delivered), Bound::Unbounded))
                    .take(count)
                    .map(|(id, _)| *id)
                    .collect();
                for id in picked {
                    group_state.pending.insert(
                        id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_ms: now,
                        },
                    );
                    group_state.last_delivered = id;
                    out.push(StreamEntry {
                        id: format_id(id),
                        fields: entries.get(&id).cloned(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn pending_summary(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BackendResult<Vec<PendingEntry>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::PendingSummary, stream)?;

        let now = self.now_ms();
        let group_state = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(group_state
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: format_id(*id),
                consumer: p.consumer.clone(),
                idle_ms: now.saturating_sub(p.delivered_ms).max(0) as u64,
            })
            .collect())
    }

    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> BackendResult<Vec<String>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Claim, stream)?;

        let now = self.now_ms();
        let lose = state.lost_claims > 0;
        if lose {
            state.lost_claims -= 1;
        }

        let StreamState {
            entries, groups, ..
        } = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut claimed = Vec::new();
        for raw in ids {
            let Some(id) = parse_id(raw) else { continue };
            if !entries.contains_key(&id) {
                group_state.pending.remove(&id);
                continue;
            }
            let Some(pending) = group_state.pending.get_mut(&id) else {
                continue;
            };
            if lose {
                pending.consumer = format!("{}-rival", consumer);
                pending.delivered_ms = now;
                continue;
            }
            let idle = now.saturating_sub(pending.delivered_ms).max(0) as u128;
            if idle >= min_idle.as_millis() {
                pending.consumer = consumer.to_string();
                pending.delivered_ms = now;
                claimed.push(format_id(id));
            }
        }
        Ok(claimed)
    }

    async fn ack(&mut self, stream: &str, group: &str, ids: &[String]) -> BackendResult<u64> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Ack, stream)?;

        let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|raw| parse_id(raw))
            .filter(|id| group_state.pending.remove(id).is_some())
            .count() as u64)
    }

    async fn delete(&mut self, stream: &str, ids: &[String]) -> BackendResult<u64> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Delete, stream)?;

        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|raw| parse_id(raw))
            .filter(|id| stream_state.entries.remove(id).is_some())
            .count() as u64)
    }

    async fn entries_after(
        &mut self,
        stream: &str,
        after: &str,
        count: usize,
    ) -> BackendResult<Vec<String>> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::EntriesAfter, stream)?;

        let after = parse_id(after)
            .ok_or_else(|| BackendError::Server("ERR Invalid stream ID specified".to_string()))?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .range((Bound::Excluded(after), Bound::Unbounded))
                    .take(count)
                    .map(|(id, _)| format_id(*id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn schedule(&mut self, key: &str, due_ms: i64, member: &[u8]) -> BackendResult<bool> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::Schedule, key)?;

        let set = state.delayed.entry(key.to_string()).or_default();
        if set.contains_key(member) {
            return Ok(false);
        }
        set.insert(member.to_vec(), due_ms);
        Ok(true)
    }

    async fn move_due(
        &mut self,
        key: &str,
        stream: &str,
        now_ms: i64,
        max_len: Option<usize>,
        limit: usize,
    ) -> BackendResult<usize> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::MoveDue, key)?;

        let Some(set) = state.delayed.get_mut(key) else {
            return Ok(0);
        };
        let mut due: Vec<(i64, Vec<u8>)> = set
            .iter()
            .filter(|(_, score)| **score <= now_ms)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        for (_, member) in &due {
            set.remove(member);
        }
        if set.is_empty() {
            state.delayed.remove(key);
        }

        let append_at = self.now_ms();
        let target = state.streams.entry(stream.to_string()).or_default();
        let mut moved = 0;
        for (_, member) in due {
            if let Some((_, payload)) = split_delay_member(&member) {
                let fields = BTreeMap::from([("message".to_string(), payload.to_vec())]);
                target.append(fields, append_at, max_len);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete_keys(&mut self, keys: &[String]) -> BackendResult<u64> {
        let store = Arc::clone(&self.store);
        let mut state = store.state.lock().await;
        self.enter(&mut state, BackendOp::DeleteKeys, &keys.join(" "))?;

        let mut removed = 0;
        for key in keys {
            if state.streams.remove(key).is_some() {
                removed += 1;
            }
            if state.delayed.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn take_last_error(&mut self) -> Option<String> {
        self.last_error.take()
    }
}
