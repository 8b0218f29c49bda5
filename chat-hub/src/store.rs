//! Accounts and the message log, held in memory and mirrored to JSON snapshots.
//!
//! Reads take a shared lock and may run concurrently. A mutation holds the
//! exclusive lock only while it changes memory; the snapshot is encoded under
//! the shared lock and written to disk with no data lock held. Each snapshot
//! file has its own write lock, taken before the mutation and held until the
//! file is renamed into place, so files land in mutation order and readers
//! never wait on disk I/O. A failed snapshot write is logged; the in-memory
//! state still advances.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const USERS_FILE: &str = "users.json";
pub const MESSAGES_FILE: &str = "messages.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
    #[error("user {0:?} not found")]
    UnknownUser(String),
    #[error("incorrect password")]
    BadCredentials,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    fn new(username: &str, password: &str) -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: digest_password(&salt, password),
            salt,
            created_at: Utc::now(),
        }
    }

    fn verify(&self, password: &str) -> bool {
        digest_password(&self.salt, password) == self.password_hash
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Builds a message with a fresh id, stamped with the current UTC time.
    pub fn compose(user_id: &str, username: &str, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for [`Store::search`]. Every supplied criterion must match.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    query: Option<String>,
    username: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl SearchCriteria {
    /// Empty strings count as "not supplied".
    pub fn new(
        query: Option<String>,
        username: Option<String>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            query: non_empty_lowercase(query),
            username: non_empty_lowercase(username),
            from,
            to,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.username.is_none() && self.from.is_none() && self.to.is_none()
    }

    fn matches(&self, message: &Message) -> bool {
        if let Some(query) = &self.query {
            if !message.content.to_lowercase().contains(query.as_str()) {
                return false;
            }
        }
        if let Some(username) = &self.username {
            if message.username.to_lowercase() != *username {
                return false;
            }
        }
        if self.from.is_some_and(|from| message.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| message.timestamp > to) {
            return false;
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    accounts: Vec<Account>,
    by_username: HashMap<String, usize>,
    messages: Vec<Message>,
}

impl Inner {
    fn insert_account(&mut self, account: Account) -> bool {
        let key = account.username.to_lowercase();
        if self.by_username.contains_key(&key) {
            return false;
        }
        self.by_username.insert(key, self.accounts.len());
        self.accounts.push(account);
        true
    }
}

struct SnapshotFile {
    path: PathBuf,
    writes: Mutex<()>,
}

impl SnapshotFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writes: Mutex::new(()),
        }
    }

    /// Serializes mutations of this file's dataset with their disk writes.
    fn turn(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, encoded: Result<Vec<u8>, StoreError>) {
        if let Err(err) = encoded.and_then(|bytes| write_snapshot(&self.path, &bytes)) {
            error!(error = %err, "failed to persist snapshot");
        }
    }
}

pub struct Store {
    inner: RwLock<Inner>,
    users: SnapshotFile,
    messages: SnapshotFile,
}

impl Store {
    /// Opens the store rooted at `data_dir`, creating the directory if needed.
    /// Missing snapshot files are treated as empty datasets.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|source| StoreError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let users_path = data_dir.join(USERS_FILE);
        let messages_path = data_dir.join(MESSAGES_FILE);

        let mut inner = Inner::default();
        for account in load_snapshot::<Account>(&users_path)? {
            let username = account.username.clone();
            if !inner.insert_account(account) {
                warn!(%username, "skipping duplicate account in snapshot");
            }
        }
        inner.messages = load_snapshot(&messages_path)?;

        debug!(
            accounts = inner.accounts.len(),
            messages = inner.messages.len(),
            dir = %data_dir.display(),
            "store loaded"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            users: SnapshotFile::new(users_path),
            messages: SnapshotFile::new(messages_path),
        })
    }

    /// Creates an account. Usernames are unique ignoring case.
    pub fn register_account(&self, username: &str, password: &str) -> Result<Account, StoreError> {
        let account = Account::new(username, password);
        let _turn = self.users.turn();
        if !self.write().insert_account(account.clone()) {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }

        let encoded = encode_snapshot(&self.users.path, &self.read().accounts);
        self.users.persist(encoded);
        Ok(account)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<Account, StoreError> {
        let inner = self.read();
        let account = inner
            .by_username
            .get(&username.to_lowercase())
            .map(|&index| &inner.accounts[index])
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))?;

        if !account.verify(password) {
            return Err(StoreError::BadCredentials);
        }
        Ok(account.clone())
    }

    /// Appends to the message log and rewrites the messages snapshot.
    pub fn append_message(&self, message: Message) {
        let _turn = self.messages.turn();
        self.write().messages.push(message);

        let encoded = encode_snapshot(&self.messages.path, &self.read().messages);
        self.messages.persist(encoded);
    }

    /// The newest `n` messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        let inner = self.read();
        let start = inner.messages.len().saturating_sub(n);
        inner.messages[start..].to_vec()
    }

    /// Matching messages in log order.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<Message> {
        self.read()
            .messages
            .iter()
            .filter(|message| criteria.matches(message))
            .cloned()
            .collect()
    }

    pub fn account_count(&self) -> usize {
        self.read().accounts.len()
    }

    pub fn message_count(&self) -> usize {
        self.read().messages.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn digest_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn non_empty_lowercase(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
}

fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn encode_snapshot<T: Serialize>(path: &Path, items: &[T]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(items).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

// Readers of `path` only ever see a complete snapshot.
fn write_snapshot(path: &Path, encoded: &[u8]) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, encoded).map_err(io_error)?;
    fs::rename(&staging, path).map_err(io_error)
}
