//! braid: deduplication and threading of raw email records.
//!
//! Workers pull raw records off a queue, normalize and fingerprint them,
//! claim each distinct piece of content exactly once, and attach claimed
//! messages to canonical conversation threads held in a shared state
//! store. The result is correct under arbitrary arrival order, duplicate
//! delivery, and partial failure.

use std::sync::Once;

use env_logger::Env;

pub mod broker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod normalizer;
pub mod store;
pub mod threading;
pub mod worker;

static LOGGER: Once = Once::new();

/// Initialize the process-wide logger once, env-driven with an `info`
/// default.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    //! In-memory collaborators and fixtures for tests.
    //!
    //! `MemoryStore` and `MemoryQueue` implement the store and broker
    //! traits with the same conditional-write semantics as the PostgreSQL
    //! implementations, so unit tests can exercise the full pipeline
    //! without a database. `database::TestDatabase` provisions a
    //! disposable PostgreSQL container for integration tests.

    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use chrono::{DateTime, TimeZone, Utc};
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use sha2::{Digest, Sha256};

    use crate::broker::{Delivery, MessageQueue, QueueError};
    use crate::config::BraidConfig;
    use crate::models::{
        DeadLetter, DedupEntry, EmailRecord, MessageFingerprint, QueueEnvelope, ThreadDocument,
        ThreadKey, ThreadMember,
    };
    use crate::store::{ClaimOutcome, PutOutcome, StateStore, StoreError};

    pub use database::{TestDatabase, TestDatabaseError};

    // ----- fixtures -----

    /// Deterministic base timestamp shared by fixture records.
    pub fn base_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 13, 10, 0, 0).unwrap()
    }

    /// An [`EmailRecord`] with the given identity, ancestor chain
    /// (oldest-first), subject, and body.
    pub fn record(message_id: &str, parent_refs: &[&str], subject: &str, body: &str) -> EmailRecord {
        EmailRecord {
            message_id: Some(message_id.to_string()),
            parent_refs: parent_refs.iter().map(|r| r.to_string()).collect(),
            subject: subject.to_string(),
            sender: "alice@example.com".to_string(),
            timestamp: base_timestamp(),
            body_text: body.to_string(),
        }
    }

    /// A [`ThreadMember`] at the shared base timestamp.
    pub fn member(message_id: &str, parent_refs: &[&str]) -> ThreadMember {
        member_at(message_id, parent_refs, base_timestamp())
    }

    /// A [`ThreadMember`] at an explicit timestamp.
    pub fn member_at(
        message_id: &str,
        parent_refs: &[&str],
        timestamp: DateTime<Utc>,
    ) -> ThreadMember {
        ThreadMember {
            message_id: message_id.to_string(),
            fingerprint: fp(message_id),
            parent_refs: parent_refs.iter().map(|r| r.to_string()).collect(),
            timestamp,
            subject: format!("subject of {}", message_id),
            sender: "alice@example.com".to_string(),
        }
    }

    /// A fingerprint derived from an arbitrary seed string.
    pub fn fp(seed: &str) -> MessageFingerprint {
        MessageFingerprint {
            digest: format!("{:x}", Sha256::digest(seed.as_bytes())),
        }
    }

    /// A raw RFC 5322 record with the given headers and body.
    pub fn raw_record(
        message_id: Option<&str>,
        references: &[&str],
        subject: &str,
        from: &str,
        date: &str,
        body: &str,
    ) -> String {
        let mut raw = String::new();
        if let Some(id) = message_id {
            raw.push_str(&format!("Message-ID: <{}>\r\n", id));
        }
        if !references.is_empty() {
            let refs: Vec<String> = references.iter().map(|r| format!("<{}>", r)).collect();
            raw.push_str(&format!("References: {}\r\n", refs.join(" ")));
        }
        raw.push_str(&format!("Subject: {}\r\n", subject));
        raw.push_str(&format!("From: {}\r\n", from));
        raw.push_str(&format!("Date: {}\r\n", date));
        raw.push_str("\r\n");
        raw.push_str(body);
        raw.push_str("\r\n");
        raw
    }

    /// A queue envelope wrapping a raw record.
    pub fn envelope(source_id: &str, raw: &str) -> QueueEnvelope {
        QueueEnvelope {
            source_id: source_id.to_string(),
            raw: raw.to_string(),
        }
    }

    /// A configuration with short timers suitable for unit tests.
    pub fn test_config() -> BraidConfig {
        BraidConfig {
            database_url: "postgres://unused".to_string(),
            workers: 1,
            queue_lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
            store_timeout: Duration::from_secs(1),
            attach_retries: 8,
            claim_retries: 3,
            max_deliveries: 5,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
        }
    }

    // ----- in-memory state store -----

    #[derive(Default)]
    struct MemoryThreads {
        threads: BTreeMap<String, ThreadDocument>,
        index: BTreeMap<String, BTreeSet<String>>,
    }

    /// In-memory [`StateStore`] with the production conditional-write
    /// semantics: set-if-absent claims via the concurrent map's entry
    /// API, revision-guarded puts, and a single critical section for
    /// merges. `fail_next_claims` injects transient failures.
    #[derive(Default)]
    pub struct MemoryStore {
        dedup: DashMap<String, DedupEntry>,
        inner: Mutex<MemoryThreads>,
        dead_letters: Mutex<Vec<DeadLetter>>,
        failing_claims: AtomicU32,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` claim calls fail with a timeout.
        pub fn fail_next_claims(&self, count: u32) {
            self.failing_claims.store(count, Ordering::SeqCst);
        }

        /// Snapshot of recorded dead letters.
        pub fn dead_letters(&self) -> Vec<DeadLetter> {
            self.dead_letters.lock().clone()
        }
    }

    impl StateStore for MemoryStore {
        async fn claim_fingerprint(&self, entry: &DedupEntry) -> Result<ClaimOutcome, StoreError> {
            let failing = self.failing_claims.load(Ordering::SeqCst);
            if failing > 0 {
                let _ = self.failing_claims.compare_exchange(
                    failing,
                    failing.saturating_sub(1),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                return Err(StoreError::Timeout);
            }

            match self.dedup.entry(entry.fingerprint.digest.clone()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => Ok(
                    ClaimOutcome::AlreadyClaimed(existing.get().message_id.clone()),
                ),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(entry.clone());
                    Ok(ClaimOutcome::Claimed)
                }
            }
        }

        async fn get_thread(&self, key: &ThreadKey) -> Result<Option<ThreadDocument>, StoreError> {
            Ok(self.inner.lock().threads.get(key.as_str()).cloned())
        }

        async fn put_thread(
            &self,
            doc: &ThreadDocument,
            indexed_ids: &[String],
        ) -> Result<PutOutcome, StoreError> {
            let mut inner = self.inner.lock();

            match inner.threads.get(doc.key.as_str()) {
                None if doc.revision == 1 => {}
                Some(existing) if existing.revision == doc.revision - 1 => {}
                _ => return Ok(PutOutcome::Conflict),
            }

            inner.threads.insert(doc.key.0.clone(), doc.clone());
            for id in indexed_ids {
                inner
                    .index
                    .entry(id.clone())
                    .or_default()
                    .insert(doc.key.0.clone());
            }
            Ok(PutOutcome::Applied)
        }

        async fn merge_threads(
            &self,
            absorbing: &ThreadDocument,
            indexed_ids: &[String],
            absorbed_key: &ThreadKey,
            absorbed_revision: i64,
        ) -> Result<PutOutcome, StoreError> {
            let mut inner = self.inner.lock();

            let absorbing_ok = inner
                .threads
                .get(absorbing.key.as_str())
                .map(|doc| doc.revision == absorbing.revision - 1)
                .unwrap_or(false);
            let absorbed_ok = inner
                .threads
                .get(absorbed_key.as_str())
                .map(|doc| doc.revision == absorbed_revision)
                .unwrap_or(false);
            if !absorbing_ok || !absorbed_ok {
                return Ok(PutOutcome::Conflict);
            }

            inner.threads.insert(absorbing.key.0.clone(), absorbing.clone());
            inner.threads.remove(absorbed_key.as_str());

            for keys in inner.index.values_mut() {
                if keys.remove(absorbed_key.as_str()) {
                    keys.insert(absorbing.key.0.clone());
                }
            }
            for id in indexed_ids {
                inner
                    .index
                    .entry(id.clone())
                    .or_default()
                    .insert(absorbing.key.0.clone());
            }
            Ok(PutOutcome::Applied)
        }

        async fn lookup_message(&self, message_id: &str) -> Result<Vec<ThreadKey>, StoreError> {
            Ok(self
                .inner
                .lock()
                .index
                .get(message_id)
                .map(|keys| keys.iter().cloned().map(ThreadKey).collect())
                .unwrap_or_default())
        }

        async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
            self.dead_letters.lock().push(dead_letter.clone());
            Ok(())
        }

        async fn list_thread_keys(&self) -> Result<Vec<ThreadKey>, StoreError> {
            Ok(self
                .inner
                .lock()
                .threads
                .keys()
                .cloned()
                .map(ThreadKey)
                .collect())
        }
    }

    // ----- in-memory queue -----

    struct QueuedMessage {
        id: i64,
        envelope: QueueEnvelope,
        available_at: Instant,
        leased_until: Option<Instant>,
        delivery_count: i32,
    }

    /// In-memory [`MessageQueue`] with leases and delivery counting.
    #[derive(Default)]
    pub struct MemoryQueue {
        messages: Mutex<Vec<QueuedMessage>>,
        next_id: AtomicI64,
    }

    impl MemoryQueue {
        pub fn new() -> Self {
            Self::default()
        }

        /// Clear every lease and delay, as if all leases had expired.
        pub fn make_all_deliverable(&self) {
            let now = Instant::now();
            for message in self.messages.lock().iter_mut() {
                message.available_at = now;
                message.leased_until = None;
            }
        }
    }

    impl MessageQueue for MemoryQueue {
        async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<i64, QueueError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.messages.lock().push(QueuedMessage {
                id,
                envelope: envelope.clone(),
                available_at: Instant::now(),
                leased_until: None,
                delivery_count: 0,
            });
            Ok(id)
        }

        async fn pull(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
            let now = Instant::now();
            let mut messages = self.messages.lock();

            let candidate = messages.iter_mut().find(|m| {
                m.available_at <= now && m.leased_until.map(|until| until < now).unwrap_or(true)
            });

            Ok(candidate.map(|message| {
                message.leased_until = Some(now + lease);
                message.delivery_count += 1;
                Delivery {
                    id: message.id,
                    envelope: message.envelope.clone(),
                    delivery_count: message.delivery_count,
                }
            }))
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.messages.lock().retain(|m| m.id != delivery.id);
            Ok(())
        }

        async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
            let mut messages = self.messages.lock();
            if let Some(message) = messages.iter_mut().find(|m| m.id == delivery.id) {
                message.leased_until = None;
                message.available_at = Instant::now() + delay;
            }
            Ok(())
        }

        async fn pending_count(&self) -> Result<i64, QueueError> {
            Ok(self.messages.lock().len() as i64)
        }
    }

    pub mod database {
        //! Disposable PostgreSQL for integration tests.

        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        impl TestDatabaseError {
            /// Whether the failure means Docker is unavailable, in which
            /// case integration tests skip instead of failing.
            pub fn is_environmental(&self) -> bool {
                matches!(self, TestDatabaseError::Container(_))
            }
        }

        /// Ephemeral database factory: one container, one freshly
        /// migrated database per instance.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            database_name: String,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;

                let options: PgConnectOptions =
                    format!("postgres://postgres:postgres@{}:{}/postgres", host, port)
                        .parse()
                        .map_err(TestDatabaseError::Sqlx)?;
                let options = options.log_statements(LevelFilter::Off);

                let database_name = format!("braid_test_{}", Uuid::new_v4().simple());
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(options.clone())
                    .await?;
                sqlx::query(&format!(
                    "CREATE DATABASE \"{}\" TEMPLATE template0",
                    database_name
                ))
                .execute(&admin_pool)
                .await?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options.database(&database_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    database_name,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            pub fn database_name(&self) -> &str {
                &self.database_name
            }

            /// Close pool connections; the container (and every database
            /// in it) is discarded on drop.
            pub async fn close(mut self) {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
            }
        }
    }
}
