//! RocksDB-backed chat store.
//!
//! Column families:
//! - `users`         — user profiles with presence fields (bincode)
//! - `conversations` — conversation records (bincode)
//! - `pairs`         — normalized participant pair → conversation id
//! - `memberships`   — `user_id ++ conversation_id` → (), for listing
//! - `messages`      — `conversation_id ++ created_at_us ++ message_id` →
//!                     LZ4(bincode(Message))
//!
//! Message keys sort chronologically inside a conversation, so paging is a
//! single reverse range scan. Every multi-key mutation is one `WriteBatch`.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use super::locks::{ConversationGuard, LockStripes, PairGuard, DEFAULT_STRIPES};
use super::records::{Conversation, Message, PairKey, User};

/// Column family names.
const CF_USERS: &str = "users";
const CF_CONVERSATIONS: &str = "conversations";
const CF_PAIRS: &str = "pairs";
const CF_MEMBERSHIPS: &str = "memberships";
const CF_MESSAGES: &str = "messages";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[
    CF_USERS,
    CF_CONVERSATIONS,
    CF_PAIRS,
    CF_MEMBERSHIPS,
    CF_MESSAGES,
];

/// `conversation_id (16) ++ created_at_us (8, BE) ++ message_id (16)`
const MESSAGE_KEY_LEN: usize = 40;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Shared block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("courier_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Record not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// A write was attempted under the lock of a different record
    WrongLock(Uuid),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Record not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::WrongLock(id) => write!(f, "Write to {id} without holding its lock"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed store for users, conversations and messages.
///
/// Also owns the two pieces of state every writer must agree on: the
/// timestamp clock and the record lock tables.
pub struct ChatStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Last issued timestamp, microseconds since epoch
    clock: AtomicI64,
    conversation_locks: LockStripes,
    pair_locks: LockStripes,
}

impl ChatStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Chat store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            clock: AtomicI64::new(0),
            conversation_locks: LockStripes::new(DEFAULT_STRIPES),
            pair_locks: LockStripes::new(DEFAULT_STRIPES),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MESSAGES => {
                // Values are LZ4-compressed before they get here
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_USERS | CF_CONVERSATIONS | CF_PAIRS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }

        opts
    }

    // ─── Clock & Locks ────────────────────────────────────────────────

    /// Issue a timestamp.
    ///
    /// Strictly increasing within this store, so two writes never share a
    /// `created_at` and a later `read_at` is never earlier than a
    /// `created_at` issued before it.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = match self.clock.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(wall.max(last + 1))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        DateTime::from_timestamp_micros(wall.max(prev + 1)).unwrap_or_else(Utc::now)
    }

    /// Take the write lock for one conversation.
    pub fn lock_conversation(&self, conversation_id: Uuid) -> ConversationGuard<'_> {
        self.conversation_locks.conversation(conversation_id)
    }

    /// Take the create lock for one participant pair.
    pub fn lock_pair(&self, pair: PairKey) -> PairGuard<'_> {
        self.pair_locks.pair(pair)
    }

    // ─── Users ────────────────────────────────────────────────────────

    /// Create a user profile.
    pub fn create_user(&self, display_name: &str) -> Result<User, StoreError> {
        let user = User::new(display_name, self.now());
        self.put_user(&user)?;
        Ok(user)
    }

    pub fn load_user(&self, user_id: Uuid) -> Result<User, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(&cf, user_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(user_id)),
        }
    }

    pub fn user_exists(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_USERS)?;
        Ok(self.db.get_cf(&cf, user_id.as_bytes())?.is_some())
    }

    /// Persist an online/offline transition.
    ///
    /// Going offline also stamps `last_seen_at`. Callers serialize
    /// transitions per user (the presence tracker does).
    pub fn update_presence(&self, user_id: Uuid, is_online: bool) -> Result<User, StoreError> {
        let mut user = self.load_user(user_id)?;
        user.is_online = is_online;
        if !is_online {
            user.last_seen_at = Some(self.now());
        }
        self.put_user(&user)?;
        Ok(user)
    }

    /// Mark every user still flagged online as offline, in one batch.
    ///
    /// Presence counts live in memory only, so on startup nobody is
    /// connected yet. Returns how many users were reset.
    pub fn reset_presence(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_USERS)?;
        let now = self.now();
        let mut batch = WriteBatch::default();
        let mut reset = 0;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, bytes) = item?;
            let mut user: User = decode(&bytes)?;
            if !user.is_online {
                continue;
            }
            user.is_online = false;
            user.last_seen_at = Some(now);
            batch.put_cf(&cf, key, encode(&user)?);
            reset += 1;
        }

        if reset > 0 {
            self.write(batch)?;
        }
        Ok(reset)
    }

    fn put_user(&self, user: &User) -> Result<(), StoreError> {
        let cf = self.cf(CF_USERS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, user.id.as_bytes(), encode(user)?);
        self.write(batch)
    }

    // ─── Conversations ────────────────────────────────────────────────

    pub fn load_conversation(&self, conversation_id: Uuid) -> Result<Conversation, StoreError> {
        let cf = self.cf(CF_CONVERSATIONS)?;
        match self.db.get_cf(&cf, conversation_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(conversation_id)),
        }
    }

    /// Look up the conversation for a participant pair.
    pub fn find_conversation(&self, pair: PairKey) -> Result<Option<Conversation>, StoreError> {
        let cf = self.cf(CF_PAIRS)?;
        let Some(id_bytes) = self.db.get_cf(&cf, pair.to_bytes())? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        self.load_conversation(id).map(Some)
    }

    /// Insert a new conversation with its pair index and memberships.
    ///
    /// The caller holds the pair lock and has checked that no conversation
    /// exists for the pair yet.
    pub fn insert_conversation(
        &self,
        guard: &PairGuard<'_>,
        conversation: &Conversation,
    ) -> Result<(), StoreError> {
        if guard.pair() != conversation.pair() {
            return Err(StoreError::WrongLock(conversation.id));
        }

        let cf_conversations = self.cf(CF_CONVERSATIONS)?;
        let cf_pairs = self.cf(CF_PAIRS)?;
        let cf_memberships = self.cf(CF_MEMBERSHIPS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_conversations, conversation.id.as_bytes(), encode(conversation)?);
        batch.put_cf(&cf_pairs, conversation.pair().to_bytes(), conversation.id.as_bytes());
        for participant in conversation.participants {
            batch.put_cf(
                &cf_memberships,
                Self::membership_key(participant, conversation.id),
                [],
            );
        }
        self.write(batch)
    }

    /// Bump `last_message_at` (never moves it backwards).
    pub fn touch_conversation(
        &self,
        guard: &ConversationGuard<'_>,
        at: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.load_conversation(guard.conversation_id())?;
        if at > conversation.last_message_at {
            conversation.last_message_at = at;
            let cf = self.cf(CF_CONVERSATIONS)?;
            let mut batch = WriteBatch::default();
            batch.put_cf(&cf, conversation.id.as_bytes(), encode(&conversation)?);
            self.write(batch)?;
        }
        Ok(conversation)
    }

    /// All conversations `user_id` participates in, unordered.
    pub fn conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        let prefix = user_id.as_bytes();
        let mut conversations = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix[..], Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() != 32 || &key[..16] != prefix {
                break;
            }
            let id = Uuid::from_slice(&key[16..])
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            conversations.push(self.load_conversation(id)?);
        }

        Ok(conversations)
    }

    // ─── Messages ─────────────────────────────────────────────────────

    /// Persist a message and bump its conversation's `last_message_at`
    /// in one atomic batch. Returns the updated conversation.
    pub fn insert_message(
        &self,
        guard: &ConversationGuard<'_>,
        message: &Message,
    ) -> Result<Conversation, StoreError> {
        if guard.conversation_id() != message.conversation_id {
            return Err(StoreError::WrongLock(message.conversation_id));
        }

        let mut conversation = self.load_conversation(message.conversation_id)?;
        if message.created_at > conversation.last_message_at {
            conversation.last_message_at = message.created_at;
        }

        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_conversations = self.cf(CF_CONVERSATIONS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_messages, Self::message_key(message), encode_message(message)?);
        batch.put_cf(&cf_conversations, conversation.id.as_bytes(), encode(&conversation)?);
        self.write(batch)?;

        Ok(conversation)
    }

    /// Up to `limit` messages with `created_at < before`, newest first.
    pub fn messages_before(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;

        // Any full 40-byte key sharing this 24-byte prefix sorts after it,
        // so a reverse seek starts strictly below the cursor.
        let mut seek = Vec::with_capacity(24);
        seek.extend_from_slice(conversation_id.as_bytes());
        match before {
            Some(at) => seek.extend_from_slice(&micros_be(at)),
            None => seek.extend_from_slice(&[0xFF; 8]),
        }

        let mut messages = Vec::with_capacity(limit.min(128));
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));
        for item in iter {
            if messages.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() != MESSAGE_KEY_LEN || &key[..16] != conversation_id.as_bytes() {
                break;
            }
            messages.push(decode_message(&value)?);
        }

        Ok(messages)
    }

    /// Most recent message of a conversation.
    pub fn latest_message(&self, conversation_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages_before(conversation_id, None, 1)?
            .into_iter()
            .next())
    }

    /// Set `read_at` on every unread message addressed to `reader`.
    ///
    /// All targeted messages are updated in one batch or none are.
    /// Returns the number of messages marked.
    pub fn mark_read(
        &self,
        guard: &ConversationGuard<'_>,
        reader: Uuid,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conversation_id = guard.conversation_id();
        let prefix = conversation_id.as_bytes();
        let cf = self.cf(CF_MESSAGES)?;

        let mut batch = WriteBatch::default();
        let mut marked = 0usize;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix[..], Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != MESSAGE_KEY_LEN || &key[..16] != prefix {
                break;
            }
            let mut message = decode_message(&value)?;
            if message.to != reader || message.read_at.is_some() {
                continue;
            }
            message.read_at = Some(at.max(message.created_at));
            batch.put_cf(&cf, &key, encode_message(&message)?);
            marked += 1;
        }

        if marked > 0 {
            self.write(batch)?;
        }

        Ok(marked)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn membership_key(user_id: Uuid, conversation_id: Uuid) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(user_id.as_bytes());
        key[16..].copy_from_slice(conversation_id.as_bytes());
        key
    }

    fn message_key(message: &Message) -> [u8; MESSAGE_KEY_LEN] {
        let mut key = [0u8; MESSAGE_KEY_LEN];
        key[..16].copy_from_slice(message.conversation_id.as_bytes());
        key[16..24].copy_from_slice(&micros_be(message.created_at));
        key[24..].copy_from_slice(message.id.as_bytes());
        key
    }
}

fn micros_be(at: DateTime<Utc>) -> [u8; 8] {
    (at.timestamp_micros().max(0) as u64).to_be_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_message(message: &Message) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(message)?))
}

fn decode_message(bytes: &[u8]) -> Result<Message, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    decode(&raw)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_store;

    fn conversation_between(store: &ChatStore, a: Uuid, b: Uuid) -> Conversation {
        let pair = PairKey::new(a, b).unwrap();
        let conversation = Conversation::new(pair, store.now());
        let guard = store.lock_pair(pair);
        store.insert_conversation(&guard, &conversation).unwrap();
        conversation
    }

    fn message(store: &ChatStore, conversation: &Conversation, from: Uuid, text: &str) -> Message {
        let now = store.now();
        Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            from,
            to: conversation.peer_of(from).unwrap(),
            content: text.to_string(),
            sent_at: now,
            created_at: now,
            read_at: None,
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = temp_store();
        assert!(store.path().exists());
    }

    #[test]
    fn test_clock_strictly_increasing() {
        let (_dir, store) = temp_store();
        let mut last = store.now();
        for _ in 0..1000 {
            let next = store.now();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_user_roundtrip_and_presence() {
        let (_dir, store) = temp_store();
        let alice = store.create_user("Alice").unwrap();
        assert!(store.user_exists(alice.id).unwrap());
        assert!(!store.user_exists(Uuid::new_v4()).unwrap());

        let loaded = store.load_user(alice.id).unwrap();
        assert_eq!(loaded, alice);
        assert!(!loaded.is_online);

        let online = store.update_presence(alice.id, true).unwrap();
        assert!(online.is_online);
        assert!(online.last_seen_at.is_none());

        let offline = store.update_presence(alice.id, false).unwrap();
        assert!(!offline.is_online);
        assert!(offline.last_seen_at.is_some());
    }

    #[test]
    fn test_reset_presence_clears_stale_online_flags() {
        let (_dir, store) = temp_store();
        let alice = store.create_user("Alice").unwrap();
        let bob = store.create_user("Bob").unwrap();
        let carol = store.create_user("Carol").unwrap();
        store.update_presence(alice.id, true).unwrap();
        store.update_presence(bob.id, true).unwrap();

        assert_eq!(store.reset_presence().unwrap(), 2);
        for id in [alice.id, bob.id] {
            let user = store.load_user(id).unwrap();
            assert!(!user.is_online);
            assert!(user.last_seen_at.is_some());
        }
        assert_eq!(store.load_user(carol.id).unwrap().last_seen_at, None);

        assert_eq!(store.reset_presence().unwrap(), 0);
    }

    #[test]
    fn test_load_missing_user() {
        let (_dir, store) = temp_store();
        let id = Uuid::new_v4();
        match store.load_user(id) {
            Err(StoreError::NotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_conversation_pair_index() {
        let (_dir, store) = temp_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conversation = conversation_between(&store, a, b);

        let found = store.find_conversation(PairKey::new(b, a).unwrap()).unwrap();
        assert_eq!(found.map(|c| c.id), Some(conversation.id));
        assert!(store
            .find_conversation(PairKey::new(a, Uuid::new_v4()).unwrap())
            .unwrap()
            .is_none());

        assert_eq!(store.conversations_for(a).unwrap().len(), 1);
        assert_eq!(store.conversations_for(b).unwrap().len(), 1);
        assert!(store.conversations_for(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_insert_conversation_wrong_lock() {
        let (_dir, store) = temp_store();
        let pair = PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let other = PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let conversation = Conversation::new(pair, store.now());
        let guard = store.lock_pair(other);
        assert!(matches!(
            store.insert_conversation(&guard, &conversation),
            Err(StoreError::WrongLock(_))
        ));
    }

    #[test]
    fn test_insert_message_bumps_conversation() {
        let (_dir, store) = temp_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conversation = conversation_between(&store, a, b);

        let msg = message(&store, &conversation, a, "hello");
        let guard = store.lock_conversation(conversation.id);
        let updated = store.insert_message(&guard, &msg).unwrap();
        drop(guard);

        assert_eq!(updated.last_message_at, msg.created_at);
        assert_eq!(
            store.load_conversation(conversation.id).unwrap().last_message_at,
            msg.created_at
        );
        assert_eq!(store.latest_message(conversation.id).unwrap(), Some(msg));
    }

    #[test]
    fn test_messages_before_is_newest_first_and_isolated() {
        let (_dir, store) = temp_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let ab = conversation_between(&store, a, b);
        let ac = conversation_between(&store, a, c);

        let mut sent = Vec::new();
        for i in 0..5 {
            let msg = message(&store, &ab, a, &format!("ab-{i}"));
            let guard = store.lock_conversation(ab.id);
            store.insert_message(&guard, &msg).unwrap();
            sent.push(msg);

            let other = message(&store, &ac, a, &format!("ac-{i}"));
            let guard = store.lock_conversation(ac.id);
            store.insert_message(&guard, &other).unwrap();
        }

        let all = store.messages_before(ab.id, None, 100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].content, "ab-4");
        assert_eq!(all[4].content, "ab-0");

        let before = store.messages_before(ab.id, Some(sent[3].created_at), 2).unwrap();
        let contents: Vec<&str> = before.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["ab-2", "ab-1"]);

        assert!(store.messages_before(ab.id, None, 0).unwrap().is_empty());
    }

    #[test]
    fn test_mark_read_only_targets_reader() {
        let (_dir, store) = temp_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conversation = conversation_between(&store, a, b);

        for (from, text) in [(a, "1"), (b, "2"), (a, "3")] {
            let msg = message(&store, &conversation, from, text);
            let guard = store.lock_conversation(conversation.id);
            store.insert_message(&guard, &msg).unwrap();
        }

        let guard = store.lock_conversation(conversation.id);
        let marked = store.mark_read(&guard, b, store.now()).unwrap();
        assert_eq!(marked, 2);
        assert_eq!(store.mark_read(&guard, b, store.now()).unwrap(), 0);
        drop(guard);

        for msg in store.messages_before(conversation.id, None, 10).unwrap() {
            if msg.to == b {
                let read_at = msg.read_at.expect("read");
                assert!(read_at >= msg.created_at);
            } else {
                assert!(msg.read_at.is_none());
            }
        }
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let (_dir, store) = temp_store();
        let conversation = conversation_between(&store, Uuid::new_v4(), Uuid::new_v4());
        let guard = store.lock_conversation(conversation.id);

        let later = store.now();
        let touched = store.touch_conversation(&guard, later).unwrap();
        assert_eq!(touched.last_message_at, later);

        let touched = store.touch_conversation(&guard, conversation.created_at).unwrap();
        assert_eq!(touched.last_message_at, later);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let user_id = {
            let store = ChatStore::open(config.clone()).unwrap();
            store.create_user("Alice").unwrap().id
        };
        let store = ChatStore::open(config).unwrap();
        assert_eq!(store.load_user(user_id).unwrap().display_name, "Alice");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
