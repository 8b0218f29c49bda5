//! Per-packet dispatch: authentication state, store access, hub broadcasts and
//! persistence submissions.
//!
//! A connection starts unauthenticated. Only `register` and `login` bind an
//! identity, and every other request except `quit` requires one. Rejections
//! are answered with `response{success: false}` to the offending connection only.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::{sync::RwLock, task};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, Identity},
    hub::{ConnectionId, Hub},
    pool::WorkerPool,
    protocol::{
        ChatBroadcast, ClientPacket, Credentials, ProtocolError, SearchQuery, ServerPacket,
        UserInfo, encode_frame,
    },
    store::{Account, Message, SearchCriteria, Store, StoreError},
};

const WELCOME: &str = "Welcome! Use register or login to get started.";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("you must login or register first")]
    NotAuthenticated,
    #[error("already logged in as {0:?}")]
    AlreadyAuthenticated(String),
    #[error("{0} requires username and password")]
    MissingCredentials(&'static str),
    #[error("chat requires non-empty content")]
    EmptyContent,
    #[error("provide at least one search criterion (query, username, from, or to)")]
    NoSearchCriteria,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// What the inbound path should do after a packet has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Authenticated connections, for `users` queries without a trip through the hub.
#[derive(Debug, Default)]
pub struct OnlineIndex {
    entries: RwLock<HashMap<ConnectionId, Identity>>,
}

impl OnlineIndex {
    pub async fn add(&self, id: ConnectionId, identity: Identity) {
        self.entries.write().await.insert(id, identity);
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Identity> {
        self.entries.write().await.remove(&id)
    }

    /// One entry per account, however many connections it has, sorted by name.
    pub async fn snapshot(&self) -> Vec<UserInfo> {
        let entries = self.entries.read().await;
        let mut by_account: HashMap<&str, &Identity> = HashMap::new();
        for identity in entries.values() {
            by_account.entry(identity.user_id.as_str()).or_insert(identity);
        }

        let mut users: Vec<UserInfo> = by_account
            .into_values()
            .map(|identity| UserInfo {
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
            })
            .collect();
        users.sort_by_key(|user| user.username.to_lowercase());
        users
    }
}

pub struct Coordinator {
    store: Arc<Store>,
    hub: Hub,
    pool: Arc<WorkerPool>,
    online: OnlineIndex,
    history_default: usize,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, hub: Hub, pool: Arc<WorkerPool>, history_default: usize) -> Self {
        Self {
            store,
            hub,
            pool,
            online: OnlineIndex::default(),
            history_default: history_default.max(1),
        }
    }

    /// Greets a new connection and adds it to the hub's live set.
    pub fn attach(&self, connection: &Connection) {
        connection.send(&ServerPacket::system(WELCOME));
        self.hub.register(connection.outbox().clone());
    }

    /// Removes a finished connection everywhere it is tracked. Safe to repeat.
    pub async fn detach(&self, connection: &Connection) {
        self.hub.unregister(connection.id());
        if let Some(identity) = self.online.remove(connection.id()).await {
            info!(conn = connection.id(), peer = ?connection.peer(), username = %identity.username, "user left");
            self.broadcast_system(&format!("{} left the chat", identity.username));
        }
    }

    pub async fn dispatch(&self, connection: &Connection, packet: ClientPacket) -> Flow {
        let result = match packet {
            ClientPacket::Register(credentials) => self.register(connection, credentials).await,
            ClientPacket::Login(credentials) => self.login(connection, credentials).await,
            ClientPacket::Chat { content } => self.chat(connection, content),
            ClientPacket::Search(query) => self.search(connection, query),
            ClientPacket::History { limit } => self.history(connection, limit),
            ClientPacket::Users {} => self.users(connection).await,
            ClientPacket::Quit {} => {
                connection.send(&ServerPacket::ok("goodbye"));
                return Flow::Close;
            }
        };

        if let Err(err) = result {
            debug!(conn = connection.id(), error = %err, "request rejected");
            connection.send(&ServerPacket::error(&err));
        }
        Flow::Continue
    }

    /// Sends a `system` notice to every live connection.
    pub fn broadcast_system(&self, message: &str) {
        match encode_frame(&ServerPacket::system(message)) {
            Ok(frame) => self.hub.broadcast(frame),
            Err(err) => warn!(error = %err, "failed to encode system notice"),
        }
    }

    async fn register(
        &self,
        connection: &Connection,
        credentials: Credentials,
    ) -> Result<(), SessionError> {
        ensure_unbound(connection)?;
        let (username, password) = validate(credentials, "register")?;

        let store = Arc::clone(&self.store);
        let account = task::spawn_blocking(move || store.register_account(&username, &password))
            .await
            .map_err(|err| SessionError::Internal(err.to_string()))??;

        info!(conn = connection.id(), username = %account.username, user_id = %account.id, "account registered");
        let reply = format!("registered and logged in as {:?}", account.username);
        self.authenticate(connection, &account, reply).await
    }

    async fn login(&self, connection: &Connection, credentials: Credentials) -> Result<(), SessionError> {
        ensure_unbound(connection)?;
        let (username, password) = validate(credentials, "login")?;
        let account = self.store.authenticate(&username, &password)?;

        info!(conn = connection.id(), username = %account.username, user_id = %account.id, "login");
        let reply = format!("logged in as {:?}", account.username);
        self.authenticate(connection, &account, reply).await
    }

    // The reply is queued before the join notice is handed to the hub, so the
    // connection always sees its own confirmation first.
    async fn authenticate(
        &self,
        connection: &Connection,
        account: &Account,
        reply: String,
    ) -> Result<(), SessionError> {
        let identity = Identity::from(account);
        if connection.bind_identity(identity.clone()).is_err() {
            let existing = connection
                .identity()
                .map(|identity| identity.username.clone())
                .unwrap_or_default();
            return Err(SessionError::AlreadyAuthenticated(existing));
        }

        self.online.add(connection.id(), identity).await;
        connection.send(&ServerPacket::ok(reply));
        self.broadcast_system(&format!("{} joined the chat", account.username));
        Ok(())
    }

    fn chat(&self, connection: &Connection, content: String) -> Result<(), SessionError> {
        let identity = require_identity(connection)?;
        if content.trim().is_empty() {
            return Err(SessionError::EmptyContent);
        }

        let message = Message::compose(&identity.user_id, &identity.username, content);
        let frame = encode_frame(&ServerPacket::Broadcast(ChatBroadcast {
            user_id: message.user_id.clone(),
            username: message.username.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        }))?;

        // Fan-out first; persistence is best effort and never delays it.
        self.hub.broadcast(frame);
        if let Err(err) = self.pool.submit(message) {
            warn!(conn = connection.id(), error = %err, "message dropped from persistence");
        }
        Ok(())
    }

    fn search(&self, connection: &Connection, query: SearchQuery) -> Result<(), SessionError> {
        require_identity(connection)?;
        let criteria = SearchCriteria::new(query.query, query.username, query.from, query.to);
        if criteria.is_empty() {
            return Err(SessionError::NoSearchCriteria);
        }

        let results = self.store.search(&criteria);
        let data = serde_json::to_value(&results)?;
        connection.send(&ServerPacket::ok_with(format!("{} result(s)", results.len()), data));
        Ok(())
    }

    fn history(&self, connection: &Connection, limit: Option<i64>) -> Result<(), SessionError> {
        require_identity(connection)?;
        let limit = limit
            .and_then(|limit| usize::try_from(limit).ok())
            .filter(|&limit| limit > 0)
            .unwrap_or(self.history_default);

        let messages = self.store.recent_messages(limit);
        let data = serde_json::to_value(&messages)?;
        connection.send(&ServerPacket::ok_with(
            format!("last {} message(s)", messages.len()),
            data,
        ));
        Ok(())
    }

    async fn users(&self, connection: &Connection) -> Result<(), SessionError> {
        require_identity(connection)?;
        let users = self.online.snapshot().await;
        let data = serde_json::to_value(&users)?;
        connection.send(&ServerPacket::ok_with(format!("{} user(s) online", users.len()), data));
        Ok(())
    }
}

fn require_identity(connection: &Connection) -> Result<&Identity, SessionError> {
    connection.identity().ok_or(SessionError::NotAuthenticated)
}

fn ensure_unbound(connection: &Connection) -> Result<(), SessionError> {
    match connection.identity() {
        Some(identity) => Err(SessionError::AlreadyAuthenticated(identity.username.clone())),
        None => Ok(()),
    }
}

fn validate(credentials: Credentials, operation: &'static str) -> Result<(String, String), SessionError> {
    let username = credentials.username.trim();
    if username.is_empty() || credentials.password.is_empty() {
        return Err(SessionError::MissingCredentials(operation));
    }
    Ok((username.to_string(), credentials.password))
}
