//! Durable directory-backed request channel
//!
//! Each message is one JSON envelope file. A message moves between three
//! directories:
//!
//! - `pending/`: waiting for delivery, possibly with a `not_before` time
//! - `inflight/`: claimed by the consumer, removed on ack
//! - `dead/`: dropped after exhausting the retry policy, rejected, or
//!   undecodable
//!
//! Any number of producers may [`SpoolChannel::enqueue`] into a spool, but
//! only one consumer holds it at a time. The consumer owns a lease file
//! (`consumer.lease`) that a background task renews; opening a spool whose
//! lease is still live fails. A lease that was not renewed in time belonged
//! to a consumer that died, so the next [`SpoolChannel::open`] takes it over
//! and returns the dead consumer's in-flight messages to `pending/`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hierhist_core::QueryStep;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{Delivery, RequestChannel, RetryPolicy};
use crate::error::{Result, StepError};
use crate::store::{BlobStore, LocalStore};

const PENDING: &str = "pending";
const INFLIGHT: &str = "inflight";
const DEAD: &str = "dead";
const ENVELOPE_EXT: &str = "json";
const LEASE_FILE: &str = "consumer.lease";

/// How long a consumer's lease stays valid without renewal
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    deliveries: u32,
    not_before_unix_ms: u64,
    /// JSON-encoded QueryStep
    payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    pid: u32,
    expires_unix_ms: u64,
}

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn channel_err(action: &str, path: &Path, err: impl std::fmt::Display) -> StepError {
    StepError::Channel(format!("{} {}: {}", action, path.display(), err))
}

fn envelope_path(root: &Path, dir: &str, id: &str) -> PathBuf {
    root.join(dir).join(format!("{}.{}", id, ENVELOPE_EXT))
}

async fn write_envelope(store: &LocalStore, root: &Path, dir: &str, envelope: &Envelope) -> Result<()> {
    let path = envelope_path(root, dir, &envelope.id);
    let bytes = serde_json::to_vec_pretty(envelope).map_err(|e| channel_err("encode", &path, e))?;
    store.put(&path, &bytes).await
}

/// The lease file at `path`, if any. An unreadable lease counts as expired.
async fn read_lease(path: &Path) -> Result<Option<Lease>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| Lease {
            owner: "unknown".into(),
            pid: 0,
            expires_unix_ms: 0,
        }))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(channel_err("read lease", path, e)),
    }
}

/// Consumer lease held by one open spool
struct LeaseHolder {
    path: PathBuf,
    owner: String,
    duration: Duration,
    lost: AtomicBool,
    store: LocalStore,
}

impl LeaseHolder {
    fn lease(&self) -> Lease {
        Lease {
            owner: self.owner.clone(),
            pid: std::process::id(),
            expires_unix_ms: now_unix_ms() + self.duration.as_millis() as u64,
        }
    }

    /// Create the lease file, taking over an expired one
    async fn acquire(&self) -> Result<()> {
        if let Some(current) = read_lease(&self.path).await? {
            if current.expires_unix_ms > now_unix_ms() {
                return Err(StepError::Channel(format!(
                    "spool {} is held by consumer {} (pid {})",
                    self.path.display(),
                    current.owner,
                    current.pid
                )));
            }
            // Only one contender can move a given lease file aside
            let aside = self
                .path
                .with_file_name(format!(".{}.expired-{}", LEASE_FILE, self.owner));
            tokio::fs::rename(&self.path, &aside)
                .await
                .map_err(|e| channel_err("take over lease", &self.path, e))?;
            let _ = tokio::fs::remove_file(&aside).await;
            tracing::warn!(
                spool = %self.path.display(),
                previous_owner = %current.owner,
                previous_pid = current.pid,
                "Took over expired spool lease"
            );
        }

        let bytes = serde_json::to_vec(&self.lease())
            .map_err(|e| channel_err("encode lease", &self.path, e))?;
        let temp = self
            .path
            .with_file_name(format!(".{}.new-{}", LEASE_FILE, self.owner));
        let create = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            // Fails if another consumer created the lease first
            tokio::fs::hard_link(&temp, &self.path).await
        };
        let created = create.await;
        let _ = tokio::fs::remove_file(&temp).await;
        created.map_err(|e| channel_err("acquire lease", &self.path, e))
    }

    async fn renew(&self) -> Result<()> {
        match read_lease(&self.path).await? {
            Some(current) if current.owner == self.owner => {
                let bytes = serde_json::to_vec(&self.lease())
                    .map_err(|e| channel_err("encode lease", &self.path, e))?;
                self.store.put(&self.path, &bytes).await
            }
            Some(current) => Err(StepError::Channel(format!(
                "lease on {} taken over by {}",
                self.path.display(),
                current.owner
            ))),
            None => Err(StepError::Channel(format!(
                "lease on {} disappeared",
                self.path.display()
            ))),
        }
    }

    fn check(&self) -> Result<()> {
        if self.lost.load(Ordering::Relaxed) {
            return Err(StepError::Channel(format!(
                "consumer lease on {} was lost",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let holder = self.clone();
        tokio::spawn(async move {
            let period = (holder.duration / 3).max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = holder.renew().await {
                    holder.lost.store(true, Ordering::Relaxed);
                    tracing::error!(error = %e, "Lost spool lease");
                    return;
                }
            }
        })
    }

    /// Remove the lease file if it is still ours
    fn release(&self) {
        if self.lost.load(Ordering::Relaxed) {
            return;
        }
        let ours = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Lease>(&bytes).ok())
            .map(|lease| lease.owner == self.owner)
            .unwrap_or(false);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct SpoolChannel {
    root: PathBuf,
    policy: RetryPolicy,
    poll_interval: Duration,
    store: LocalStore,
    notify: Notify,
    lease: Arc<LeaseHolder>,
    renewal: JoinHandle<()>,
}

impl SpoolChannel {
    /// Open (or create) a spool rooted at `root` as its consumer, with
    /// [`DEFAULT_LEASE`].
    pub async fn open(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Result<Self> {
        Self::open_with_lease(root, policy, poll_interval, DEFAULT_LEASE).await
    }

    /// Open as consumer, holding the lease for `lease` between renewals.
    ///
    /// Fails while another consumer holds a live lease. In-flight messages
    /// of a previous consumer are returned to `pending/`.
    pub async fn open_with_lease(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        poll_interval: Duration,
        lease: Duration,
    ) -> Result<Self> {
        let root = root.into();
        create_dirs(&root).await?;

        let holder = Arc::new(LeaseHolder {
            path: root.join(LEASE_FILE),
            owner: format!("{}-{:016x}", std::process::id(), rand::random::<u64>()),
            duration: lease,
            lost: AtomicBool::new(false),
            store: LocalStore::new(),
        });
        holder.acquire().await?;
        let renewal = holder.spawn_renewal();

        let channel = Self {
            root,
            policy,
            poll_interval,
            store: LocalStore::new(),
            notify: Notify::new(),
            lease: holder,
            renewal,
        };

        let recovered = channel.recover_inflight().await?;
        tracing::info!(
            spool = %channel.root.display(),
            owner = %channel.lease.owner,
            recovered,
            "Opened spool"
        );
        Ok(channel)
    }

    /// Add `step` to the spool at `root` without consuming from it.
    ///
    /// Returns the message identifier.
    pub async fn enqueue(root: &Path, step: &QueryStep) -> Result<String> {
        create_dirs(root).await?;
        let payload = String::from_utf8(
            step.to_json()
                .map_err(|e| StepError::Channel(e.to_string()))?,
        )
        .map_err(|e| StepError::Channel(e.to_string()))?;

        let now = now_unix_ms();
        let id = format!(
            "{:016}-{:010}-{:010}",
            now,
            std::process::id(),
            MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let envelope = Envelope {
            id,
            deliveries: 0,
            not_before_unix_ms: now,
            payload,
        };
        write_envelope(&LocalStore::new(), root, PENDING, &envelope).await?;
        tracing::debug!(
            message = %envelope.id,
            query_id = %step.query_id,
            level = step.level,
            "Published message"
        );
        Ok(envelope.id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn envelope_path(&self, dir: &str, id: &str) -> PathBuf {
        envelope_path(&self.root, dir, id)
    }

    async fn recover_inflight(&self) -> Result<usize> {
        let mut recovered = 0;
        for path in self.list(INFLIGHT).await? {
            if let Some(name) = path.file_name() {
                let target = self.dir(PENDING).join(name);
                tokio::fs::rename(&path, &target)
                    .await
                    .map_err(|e| channel_err("recover", &path, e))?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Envelope files in `dir`, oldest identifier first
    async fn list(&self, dir: &str) -> Result<Vec<PathBuf>> {
        let path = self.dir(dir);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| channel_err("list", &path, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| channel_err("list", &path, e))?
        {
            let file = entry.path();
            let is_envelope = file.extension().map(|e| e == ENVELOPE_EXT).unwrap_or(false);
            let is_temp = file
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            if is_envelope && !is_temp {
                files.push(file);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_envelope(path: &Path) -> Result<Envelope> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| channel_err("read", path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| channel_err("decode", path, e))
    }

    /// Move an envelope that cannot be decoded out of the way
    async fn quarantine(&self, path: &Path, err: &serde_json::Error) -> Result<()> {
        let target = match path.file_name() {
            Some(name) => self.dir(DEAD).join(name),
            None => return Err(channel_err("quarantine", path, "no file name")),
        };
        tokio::fs::rename(path, &target)
            .await
            .map_err(|e| channel_err("quarantine", path, e))?;
        tracing::error!(
            path = %path.display(),
            error = %err,
            "Dead-lettering undecodable envelope"
        );
        crate::metrics::record_dead_letter();
        Ok(())
    }

    /// Try to claim one deliverable message. Returns the delivery or the
    /// earliest `not_before` among messages that are still backing off.
    async fn try_claim(&self) -> Result<std::result::Result<Delivery, Option<u64>>> {
        let now = now_unix_ms();
        let mut earliest: Option<u64> = None;

        for path in self.list(PENDING).await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(channel_err("read", &path, e)),
            };
            let mut envelope: Envelope = match serde_json::from_slice(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.quarantine(&path, &e).await?;
                    continue;
                }
            };

            if envelope.not_before_unix_ms > now {
                earliest = Some(
                    earliest.map_or(envelope.not_before_unix_ms, |t| {
                        t.min(envelope.not_before_unix_ms)
                    }),
                );
                continue;
            }

            let claimed = self.envelope_path(INFLIGHT, &envelope.id);
            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(channel_err("claim", &path, e)),
            }

            envelope.deliveries += 1;
            write_envelope(&self.store, &self.root, INFLIGHT, &envelope).await?;

            return Ok(Ok(Delivery {
                id: envelope.id,
                attempt: envelope.deliveries,
                payload: envelope.payload.into_bytes(),
            }));
        }

        Ok(Err(earliest))
    }

    /// Number of messages waiting in `pending/`
    pub async fn pending_len(&self) -> Result<usize> {
        Ok(self.list(PENDING).await?.len())
    }

    /// Number of claimed messages not yet acknowledged
    pub async fn inflight_len(&self) -> Result<usize> {
        Ok(self.list(INFLIGHT).await?.len())
    }

    /// Number of dead-lettered messages
    pub async fn dead_letter_len(&self) -> Result<usize> {
        Ok(self.list(DEAD).await?.len())
    }
}

async fn create_dirs(root: &Path) -> Result<()> {
    for dir in [PENDING, INFLIGHT, DEAD] {
        let path = root.join(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| channel_err("create", &path, e))?;
    }
    Ok(())
}

impl Drop for SpoolChannel {
    fn drop(&mut self) {
        self.renewal.abort();
        self.lease.release();
    }
}

#[async_trait]
impl RequestChannel for SpoolChannel {
    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            self.lease.check()?;
            let notified = self.notify.notified();
            let wait = match self.try_claim().await? {
                Ok(delivery) => {
                    tracing::debug!(
                        message = %delivery.id,
                        attempt = delivery.attempt,
                        "Claimed message"
                    );
                    return Ok(Some(delivery));
                }
                Err(Some(not_before)) => {
                    Duration::from_millis(not_before.saturating_sub(now_unix_ms()))
                        .min(self.poll_interval)
                }
                Err(None) => self.poll_interval,
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn publish(&self, step: &QueryStep) -> Result<()> {
        Self::enqueue(&self.root, step).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.lease.check()?;
        let path = self.envelope_path(INFLIGHT, &delivery.id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| channel_err("ack", &path, e))
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        self.lease.check()?;
        let path = self.envelope_path(INFLIGHT, &delivery.id);
        let mut envelope = Self::read_envelope(&path).await?;

        let target = if self.policy.is_exhausted(envelope.deliveries) {
            tracing::warn!(
                message = %envelope.id,
                attempts = envelope.deliveries,
                "Dead-lettering message after exhausting retries"
            );
            crate::metrics::record_dead_letter();
            DEAD
        } else {
            let delay = self.policy.backoff(envelope.deliveries);
            envelope.not_before_unix_ms = now_unix_ms() + delay.as_millis() as u64;
            PENDING
        };

        write_envelope(&self.store, &self.root, target, &envelope).await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| channel_err("release", &path, e))?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        self.lease.check()?;
        let path = self.envelope_path(INFLIGHT, &delivery.id);
        let target = self.envelope_path(DEAD, &delivery.id);
        tokio::fs::rename(&path, &target)
            .await
            .map_err(|e| channel_err("reject", &path, e))?;
        tracing::warn!(
            message = %delivery.id,
            attempts = delivery.attempt,
            "Dead-lettering message that cannot succeed"
        );
        crate::metrics::record_dead_letter();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hierhist_core::HelperSharedInfo;
    use tempfile::tempdir;

    fn step(level: u32) -> QueryStep {
        QueryStep {
            query_id: "spooled".into(),
            level,
            partner_shared_info: HelperSharedInfo::new("b", "/b"),
            expand_config_uri: "/plan.json".into(),
            total_epsilon: 1.0,
            result_dir: "/results".into(),
            partial_report_uri: "/reports".into(),
            sum_params_uri: "/params".into(),
            prefixes_uri: None,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    async fn open(dir: &Path, max_attempts: u32) -> SpoolChannel {
        SpoolChannel::open(dir, policy(max_attempts), Duration::from_millis(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 3).await;

        channel.publish(&step(0)).await.unwrap();
        assert_eq!(channel.pending_len().await.unwrap(), 1);

        let delivery = channel.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.step().unwrap(), step(0));
        assert_eq!(channel.pending_len().await.unwrap(), 0);

        channel.ack(&delivery).await.unwrap();
        assert!(channel.list(INFLIGHT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 2).await;
        channel.publish(&step(1)).await.unwrap();

        let first = channel.receive().await.unwrap().unwrap();
        channel.nack(&first).await.unwrap();

        let second = channel.receive().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        channel.nack(&second).await.unwrap();

        assert_eq!(channel.pending_len().await.unwrap(), 0);
        assert_eq!(channel.dead_letter_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_recovers_inflight() {
        let dir = tempdir().unwrap();
        {
            let channel = open(dir.path(), 3).await;
            channel.publish(&step(0)).await.unwrap();
            let _claimed = channel.receive().await.unwrap().unwrap();
            assert_eq!(channel.pending_len().await.unwrap(), 0);
        }

        let reopened = open(dir.path(), 3).await;
        assert_eq!(reopened.pending_len().await.unwrap(), 1);
        let delivery = reopened.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 2);
    }

    #[tokio::test]
    async fn test_messages_delivered_in_publish_order() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 3).await;
        channel.publish(&step(0)).await.unwrap();
        channel.publish(&step(1)).await.unwrap();

        let a = channel.receive().await.unwrap().unwrap();
        let b = channel.receive().await.unwrap().unwrap();
        assert_eq!(a.step().unwrap().level, 0);
        assert_eq!(b.step().unwrap().level, 1);
    }

    #[tokio::test]
    async fn test_second_consumer_is_refused() {
        let dir = tempdir().unwrap();
        let first = open(dir.path(), 3).await;
        first.publish(&step(0)).await.unwrap();
        let delivery = first.receive().await.unwrap().unwrap();

        let second = SpoolChannel::open(dir.path(), policy(3), Duration::from_millis(5)).await;
        assert!(matches!(second, Err(StepError::Channel(_))));

        // The holder's in-flight message was left alone
        first.ack(&delivery).await.unwrap();
        assert!(first.list(INFLIGHT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_held() {
        let dir = tempdir().unwrap();
        let lease = Duration::from_millis(90);
        let poll = Duration::from_millis(5);
        let _holder = SpoolChannel::open_with_lease(dir.path(), policy(3), poll, lease)
            .await
            .unwrap();

        tokio::time::sleep(lease * 4).await;
        let contender = SpoolChannel::open_with_lease(dir.path(), policy(3), poll, lease).await;
        assert!(contender.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let dir = tempdir().unwrap();
        create_dirs(dir.path()).await.unwrap();
        let stale = Lease {
            owner: "crashed".into(),
            pid: 1,
            expires_unix_ms: now_unix_ms() - 1_000,
        };
        std::fs::write(dir.path().join(LEASE_FILE), serde_json::to_vec(&stale).unwrap()).unwrap();
        let orphan = Envelope {
            id: "0000000000000001-0000000001-0000000000".into(),
            deliveries: 1,
            not_before_unix_ms: 0,
            payload: String::from_utf8(step(0).to_json().unwrap()).unwrap(),
        };
        write_envelope(&LocalStore::new(), dir.path(), INFLIGHT, &orphan)
            .await
            .unwrap();

        let channel = open(dir.path(), 3).await;
        assert_eq!(channel.pending_len().await.unwrap(), 1);
        let delivery = channel.receive().await.unwrap().unwrap();
        assert_eq!(delivery.id, orphan.id);
        assert_eq!(delivery.attempt, 2);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_dead_lettered() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 3).await;
        std::fs::write(dir.path().join(PENDING).join("0000-bad.json"), b"not json").unwrap();
        channel.publish(&step(1)).await.unwrap();

        let delivery = channel.receive().await.unwrap().unwrap();
        assert_eq!(delivery.step().unwrap(), step(1));
        assert_eq!(channel.dead_letter_len().await.unwrap(), 1);
        assert!(dir.path().join(DEAD).join("0000-bad.json").is_file());
    }

    #[tokio::test]
    async fn test_reject_skips_remaining_attempts() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 5).await;
        channel.publish(&step(0)).await.unwrap();

        let delivery = channel.receive().await.unwrap().unwrap();
        channel.reject(&delivery).await.unwrap();
        assert_eq!(channel.pending_len().await.unwrap(), 0);
        assert_eq!(channel.dead_letter_len().await.unwrap(), 1);
        assert!(channel.list(INFLIGHT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_producer_enqueues_while_consumer_holds_spool() {
        let dir = tempdir().unwrap();
        let channel = open(dir.path(), 3).await;

        let id = SpoolChannel::enqueue(dir.path(), &step(0)).await.unwrap();
        let delivery = channel.receive().await.unwrap().unwrap();
        assert_eq!(delivery.id, id);
    }
}
