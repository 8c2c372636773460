//! The hub's connection registry: which clients are in which sessions,
//! per-user and per-IP connection counts, and the per-session sequence
//! counters used to stamp outbound frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::client::ClientHandle;

#[derive(Default)]
pub struct ClientRegistry {
    sessions: DashMap<Uuid, DashMap<Uuid, ClientHandle>>,
    user_connections: DashMap<Uuid, usize>,
    ip_connections: DashMap<Arc<str>, usize>,
    session_sequences: DashMap<Uuid, AtomicU64>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ClientHandle) {
        self.sessions
            .entry(handle.session_id)
            .or_default()
            .insert(handle.client_id, handle.clone());

        if let Some(user_id) = handle.user_id {
            *self.user_connections.entry(user_id).or_insert(0) += 1;
        }
        *self.ip_connections.entry(handle.ip.clone()).or_insert(0) += 1;
    }

    /// Removes the client and reports whether the session became empty.
    pub fn remove(&self, session_id: Uuid, client_id: Uuid) -> (Option<ClientHandle>, bool) {
        let removed = self
            .sessions
            .get(&session_id)
            .and_then(|clients| clients.remove(&client_id))
            .map(|(_, handle)| handle);

        if let Some(handle) = &removed {
            if let Some(user_id) = handle.user_id {
                if let Some(mut count) = self.user_connections.get_mut(&user_id) {
                    *count = count.saturating_sub(1);
                }
            }
            if let Some(mut count) = self.ip_connections.get_mut(&handle.ip) {
                *count = count.saturating_sub(1);
            }
        }

        let became_empty = self
            .sessions
            .get(&session_id)
            .map(|clients| clients.is_empty())
            .unwrap_or(false);

        if became_empty {
            self.sessions.remove(&session_id);
            self.session_sequences.remove(&session_id);
        }

        (removed, became_empty)
    }

    pub fn get(&self, session_id: Uuid, client_id: Uuid) -> Option<ClientHandle> {
        self.sessions.get(&session_id)?.get(&client_id).map(|c| c.clone())
    }

    pub fn clients_in_session(&self, session_id: Uuid) -> Vec<ClientHandle> {
        self.sessions
            .get(&session_id)
            .map(|clients| clients.iter().map(|c| c.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.user_connections.get(&user_id).map(|c| *c).unwrap_or(0)
    }

    pub fn ip_connection_count(&self, ip: &str) -> usize {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }

    /// Assigns the next strictly increasing sequence number for `session_id`.
    pub fn next_sequence(&self, session_id: Uuid) -> u64 {
        self.session_sequences
            .entry(session_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    pub fn remove_session(&self, session_id: Uuid) -> Vec<ClientHandle> {
        let clients = self
            .sessions
            .remove(&session_id)
            .map(|(_, clients)| clients.into_iter().map(|(_, handle)| handle).collect())
            .unwrap_or_default();
        self.session_sequences.remove(&session_id);
        clients
    }

    pub fn clear(&self) -> Vec<ClientHandle> {
        let all: Vec<ClientHandle> = self
            .sessions
            .iter()
            .flat_map(|entry| entry.value().iter().map(|c| c.value().clone()).collect::<Vec<_>>())
            .collect();
        self.sessions.clear();
        self.session_sequences.clear();
        self.user_connections.clear();
        self.ip_connections.clear();
        all
    }
}
