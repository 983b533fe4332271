//! Session manager - registry of stream sessions keyed by stream key
//!
//! This module provides:
//! - Lookup and lazy creation of sessions with concurrent access
//! - Automatic removal of sessions once they close
//! - Cross-session lookups of publishers and subscribers by id
//! - Aggregated state for the admin status API

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::host::Host;
use crate::session::{Reservation, StreamSession};
use crate::status::StreamSessionState;
use crate::types::{PublicProfile, SessionId, StreamKey};
use crate::whep::WhepSession;

pub struct SessionManager {
    config: SfuConfig,

    /// Live sessions (uses DashMap for lock-free concurrent access)
    sessions: DashMap<StreamKey, Arc<StreamSession>>,

    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(config: SfuConfig) -> Arc<Self> {
        info!(
            status_interval_ms = config.status_interval_ms,
            relay_mode = ?config.relay_mode,
            "Session manager initialized"
        );

        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Return the open session for the profile's stream key, creating one
    /// when none exists. A WHIP caller also refreshes the stored profile.
    pub fn get_or_add_session(
        self: &Arc<Self>,
        profile: &PublicProfile,
        is_whip: bool,
    ) -> Result<Arc<StreamSession>> {
        if self.cancel.is_cancelled() {
            return Err(SfuError::SessionClosed);
        }

        let mut created = false;
        let session = {
            let mut entry = self
                .sessions
                .entry(profile.stream_key.clone())
                .or_insert_with(|| {
                    created = true;
                    StreamSession::new(profile, &self.config, &self.cancel)
                });
            if entry.is_closed() {
                debug!(stream_key = %profile.stream_key, "Replacing closed session");
                *entry = StreamSession::new(profile, &self.config, &self.cancel);
                created = true;
            }
            Arc::clone(entry.value())
        };

        if created {
            self.spawn_session_watcher(&session);
            info!(
                stream_key = %profile.stream_key,
                total_sessions = self.sessions.len(),
                "Added stream session"
            );
        } else if is_whip {
            session.update_profile(profile);
        }

        Ok(session)
    }

    /// Look up or create the session for `profile` and hold it open for an
    /// offer. A session collected between lookup and reservation is replaced
    /// by a fresh one.
    pub fn reserve_session(
        self: &Arc<Self>,
        profile: &PublicProfile,
        is_whip: bool,
    ) -> Result<Reservation> {
        match self.get_or_add_session(profile, is_whip)?.reserve() {
            Err(SfuError::SessionClosed) => {
                debug!(stream_key = %profile.stream_key, "Session closed before reservation, retrying");
                self.get_or_add_session(profile, is_whip)?.reserve()
            }
            result => result,
        }
    }

    /// Drop the registry entry once the session closes, unless it has already
    /// been replaced.
    fn spawn_session_watcher(self: &Arc<Self>, session: &Arc<StreamSession>) {
        let manager = Arc::downgrade(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            session.cancel_token().cancelled().await;
            let Some(manager) = manager.upgrade() else { return };
            let removed = manager
                .sessions
                .remove_if(session.stream_key(), |_, current| Arc::ptr_eq(current, &session));
            if removed.is_some() {
                info!(
                    stream_key = %session.stream_key(),
                    total_sessions = manager.sessions.len(),
                    "Removed stream session"
                );
            }
        });
    }

    #[must_use]
    pub fn get_session(&self, stream_key: &StreamKey) -> Option<Arc<StreamSession>> {
        self.sessions
            .get(stream_key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_closed())
    }

    fn open_sessions(&self) -> Vec<Arc<StreamSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_closed())
            .collect()
    }

    /// States of every open session, sorted by stream key. Private streams are
    /// only listed when `include_private` is set.
    #[must_use]
    pub fn get_session_states(&self, include_private: bool) -> Vec<StreamSessionState> {
        let mut states: Vec<_> = self
            .open_sessions()
            .into_iter()
            .filter(|session| include_private || session.is_public())
            .map(|session| session.state())
            .collect();
        states.sort_by(|a, b| a.stream_key.as_str().cmp(b.stream_key.as_str()));
        states
    }

    /// Apply a profile change to its session. Returns false when no session
    /// exists for the stream key.
    pub fn update_profile(&self, profile: &PublicProfile) -> bool {
        match self.get_session(&profile.stream_key) {
            Some(session) => {
                session.update_profile(profile);
                true
            }
            None => false,
        }
    }

    /// Find a subscriber by id across all sessions.
    #[must_use]
    pub fn get_whep_session(
        &self,
        id: &SessionId,
    ) -> Option<(Arc<StreamSession>, Arc<WhepSession>)> {
        self.open_sessions()
            .into_iter()
            .find_map(|session| session.whep(id).map(|whep| (session, whep)))
    }

    /// Find a publisher by id across all sessions.
    #[must_use]
    pub fn get_host_session(&self, id: &SessionId) -> Option<(Arc<StreamSession>, Arc<Host>)> {
        self.open_sessions().into_iter().find_map(|session| {
            session
                .host()
                .filter(|host| host.id() == id)
                .map(|host| (session, host))
        })
    }

    pub fn set_audio_layer(&self, whep_id: &SessionId, rid: &str) -> Result<()> {
        let (session, _) = self
            .get_whep_session(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        session.set_audio_layer(whep_id, rid)
    }

    pub fn set_video_layer(&self, whep_id: &SessionId, rid: &str) -> Result<()> {
        let (session, _) = self
            .get_whep_session(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        session.set_video_layer(whep_id, rid)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session and refuse new ones.
    pub async fn shutdown(&self) {
        info!(sessions = self.sessions.len(), "Shutting down session manager");
        self.cancel.cancel();

        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        join_all(sessions.iter().map(|session| session.close())).await;
        self.sessions.clear();
    }
}
