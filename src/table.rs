use std::collections::{HashMap, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ChatError;
use crate::session::Outbox;
use crate::types::SessionId;

/// A live member of a room.
pub struct Member {
    pub username: String,
    pub outbox: Outbox,
    pub cancel: CancellationToken,
}

/// Who a routed message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Everyone except the sender.
    All,
    /// Exactly this session, even when it is the sender.
    One(SessionId),
}

pub fn departure_notice(username: &str) -> String {
    format!("User {username} disconnected")
}

/// Bidirectional session ↔ username map for one room.
///
/// A username maps to at most one session, and both directions are updated
/// together by `insert` and `remove`.
#[derive(Default)]
pub struct ConnectionTable {
    sessions: HashMap<SessionId, Member>,
    by_name: HashMap<String, SessionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SessionId, member: Member) -> Result<(), ChatError> {
        if self.by_name.contains_key(&member.username) {
            return Err(ChatError::UserAlreadyOnline(member.username));
        }
        self.by_name.insert(member.username.clone(), id);
        self.sessions.insert(id, member);
        Ok(())
    }

    /// Remove a session and its username mapping, cancelling the session so
    /// its reader stops. `None` if it was already gone.
    pub fn remove(&mut self, id: SessionId) -> Option<Member> {
        let member = self.sessions.remove(&id)?;
        self.by_name.remove(&member.username);
        member.cancel.cancel();
        Some(member)
    }

    pub fn find(&self, username: &str) -> Option<SessionId> {
        self.by_name.get(username).copied()
    }

    pub fn username(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).map(|m| m.username.as_str())
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue `text` for every recipient of `target`.
    ///
    /// Each delivery is independent. A recipient whose outbox is closed is
    /// evicted on the spot and its departure is announced to whoever is
    /// left, after which delivery continues with the remaining recipients.
    /// Returns the usernames evicted along the way.
    pub fn route(&mut self, from: SessionId, target: Target, text: String) -> Vec<String> {
        let mut pending = VecDeque::from([(from, target, text)]);
        let mut evicted = Vec::new();

        while let Some((from, target, text)) = pending.pop_front() {
            let recipients: Vec<SessionId> = match target {
                Target::All => self
                    .sessions
                    .keys()
                    .copied()
                    .filter(|id| *id != from)
                    .collect(),
                Target::One(id) => vec![id],
            };

            for id in recipients {
                let Some(member) = self.sessions.get(&id) else {
                    debug!(session = %id, "recipient already gone");
                    continue;
                };
                if member.outbox.send(text.clone()).is_ok() {
                    continue;
                }
                if let Some(gone) = self.remove(id) {
                    info!(session = %id, username = %gone.username, "evicted after failed delivery");
                    pending.push_back((id, Target::All, departure_notice(&gone.username)));
                    evicted.push(gone.username);
                }
            }
        }

        evicted
    }

    /// Remove a session and announce its departure. Runs at most once per
    /// session: later calls find nothing and announce nothing.
    pub fn leave(&mut self, id: SessionId) -> Option<String> {
        let member = self.remove(id)?;
        self.route(id, Target::All, departure_notice(&member.username));
        Some(member.username)
    }
}
