use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vault_client::VaultClient;

use super::{new_sink, Sink};
use crate::auth::TokenReceiver;
use crate::config::SinkConfig;
use crate::crypto::{DhKeyPair, Envelope, PublicKeyInfo};
use crate::error::{AgentError, Result};

const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_JITTER: Duration = Duration::from_secs(1);

/// Curve25519 encryption of a sink's output
#[derive(Debug, Clone)]
pub struct DhSettings {
    /// JSON file holding the receiver's public key
    pub path: PathBuf,
    pub aad: String,
    pub derive_key: bool,
}

impl DhSettings {
    fn from_config(config: &SinkConfig) -> Result<Option<Self>> {
        if config.dh_type.as_deref().unwrap_or_default().is_empty() {
            return Ok(None);
        }
        let path = config
            .dh_path
            .clone()
            .ok_or_else(|| AgentError::Config("sink dh_type requires dh_path".to_string()))?;
        let aad = match (&config.aad, &config.aad_env_var) {
            (Some(aad), _) => aad.clone(),
            (None, Some(var)) => std::env::var(var).unwrap_or_default(),
            (None, None) => String::new(),
        };
        Ok(Some(Self {
            path,
            aad,
            derive_key: config.derive_key,
        }))
    }
}

/// A sink plus the transformations applied before each write
pub struct ConfiguredSink {
    pub sink: Arc<dyn Sink>,
    pub wrap_ttl: Option<Duration>,
    pub dh: Option<DhSettings>,
}

impl ConfiguredSink {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            wrap_ttl: None,
            dh: None,
        }
    }

    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        Ok(Self {
            sink: new_sink(config)?,
            wrap_ttl: config.wrap_ttl.filter(|t| !t.is_zero()),
            dh: DhSettings::from_config(config)?,
        })
    }
}

struct WorkItem {
    sink: usize,
    token: String,
}

/// Result of one delivery task; `outcome` is `None` when a newer token
/// cancelled the write before it finished.
struct Delivered {
    sink: usize,
    token: String,
    outcome: Option<Result<()>>,
}

/// Everything a delivery task needs, shared with the spawned writes
struct Delivery {
    client: VaultClient,
    sinks: Vec<ConfiguredSink>,
    dh_keys: DhKeyPair,
}

impl Delivery {
    async fn prepare(&self, sink: &ConfiguredSink, token: &str) -> Result<String> {
        let mut payload = token.to_string();

        if let Some(ttl) = sink.wrap_ttl {
            let mut client = self.client.clone();
            client.set_token(token);
            let wrap_info = client
                .wrap(&serde_json::json!({ "token": token }), ttl)
                .await?;
            payload = serde_json::to_string(&wrap_info)?;
        }

        if let Some(ref dh) = sink.dh {
            let raw = tokio::fs::read(&dh.path).await.map_err(|e| {
                AgentError::Sink(format!("reading DH public key {}: {}", dh.path.display(), e))
            })?;
            let info: PublicKeyInfo = serde_json::from_slice(&raw)?;
            let peer = info.key()?;
            let key = self.dh_keys.shared_key(&peer, dh.derive_key)?;
            let envelope = Envelope::seal(
                &key,
                Some(self.dh_keys.public_key()),
                payload.as_bytes(),
                dh.aad.as_bytes(),
            )?;
            payload = String::from_utf8_lossy(&envelope.to_json()?).into_owned();
        }

        Ok(payload)
    }

    async fn deliver(&self, sink: usize, token: &str) -> Result<()> {
        let sink = &self.sinks[sink];
        let payload = self.prepare(sink, token).await?;
        sink.sink.write_token(&payload).await
    }
}

/// Per-sink bookkeeping inside the run loop
#[derive(Default)]
struct Slot {
    /// Cancels the write currently in flight
    in_flight: Option<CancellationToken>,
    /// Next write to start once the in-flight one has been joined
    deferred: Option<WorkItem>,
}

/// Delivers every new token from the auth handler to all sinks, retrying
/// failed writes until they succeed or a newer token makes them stale.
///
/// Each write runs as its own task so a stuck sink never blocks shutdown
/// or the arrival of newer tokens. A sink has at most one write in flight.
pub struct SinkServer {
    delivery: Arc<Delivery>,
    remaining: Arc<AtomicI64>,
    retries: Arc<AtomicU64>,
    written_tx: watch::Sender<bool>,
}

impl SinkServer {
    pub fn new(client: VaultClient, sinks: Vec<ConfiguredSink>) -> Self {
        let (written_tx, _) = watch::channel(false);
        Self {
            delivery: Arc::new(Delivery {
                client: client.clone_with_headers(),
                sinks,
                dh_keys: DhKeyPair::generate(),
            }),
            remaining: Arc::new(AtomicI64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
            written_tx,
        }
    }

    /// Becomes `true` once every sink has written a token
    pub fn token_written(&self) -> watch::Receiver<bool> {
        self.written_tx.subscribe()
    }

    /// Writes outstanding for the current token
    pub fn remaining(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.remaining)
    }

    /// Consecutive failed writes since the last successful one
    pub fn retries(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.retries)
    }

    pub fn dh_public_key(&self) -> [u8; 32] {
        self.delivery.dh_keys.public_key()
    }

    fn retry_delay() -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64(RETRY_BASE.as_secs_f64() + RETRY_JITTER.as_secs_f64() * jitter)
    }

    fn spawn_write(
        &self,
        tasks: &mut JoinSet<Delivered>,
        slot: &mut Slot,
        cancel: &CancellationToken,
        item: WorkItem,
    ) {
        let stop = cancel.child_token();
        slot.in_flight = Some(stop.clone());
        let delivery = Arc::clone(&self.delivery);
        tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = stop.cancelled() => None,
                r = delivery.deliver(item.sink, &item.token) => Some(r),
            };
            Delivered {
                sink: item.sink,
                token: item.token,
                outcome,
            }
        });
    }

    pub async fn run(self, cancel: CancellationToken, mut tokens: TokenReceiver) -> Result<()> {
        let sink_count = self.delivery.sinks.len();
        tracing::info!(sinks = sink_count, "starting sink server");

        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let mut tasks: JoinSet<Delivered> = JoinSet::new();
        let mut slots: Vec<Slot> = (0..sink_count).map(|_| Slot::default()).collect();
        let mut latest: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = tokens.changed() => {
                    if changed.is_err() {
                        tracing::debug!("token stream closed");
                        break;
                    }
                    let Some(token) = tokens.borrow_and_update().clone() else {
                        continue;
                    };
                    if token.is_empty() || latest.as_deref() == Some(token.as_str()) {
                        continue;
                    }
                    tracing::debug!("new token, queueing sink writes");
                    latest = Some(token.clone());
                    self.remaining.store(sink_count as i64, Ordering::SeqCst);
                    for (sink, slot) in slots.iter_mut().enumerate() {
                        if let Some(stop) = slot.in_flight.as_ref() {
                            stop.cancel();
                        }
                        slot.deferred = None;
                        let _ = work_tx.send(WorkItem { sink, token: token.clone() });
                    }
                }
                Some(item) = work_rx.recv() => {
                    if latest.as_deref() != Some(item.token.as_str()) {
                        tracing::trace!("discarding write for a superseded token");
                        continue;
                    }
                    let slot = &mut slots[item.sink];
                    if slot.in_flight.is_some() {
                        slot.deferred = Some(item);
                    } else {
                        self.spawn_write(&mut tasks, slot, &cancel, item);
                    }
                }
                Some(joined) = tasks.join_next() => {
                    let done = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            tracing::error!(error = %e, "sink write task failed");
                            continue;
                        }
                    };
                    let sink_type = self.delivery.sinks[done.sink].sink.sink_type();
                    let slot = &mut slots[done.sink];
                    slot.in_flight = None;
                    let current = latest.as_deref() == Some(done.token.as_str());

                    match done.outcome {
                        Some(Ok(())) if current => {
                            self.retries.store(0, Ordering::SeqCst);
                            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                                tracing::info!("token written to all sinks");
                                self.written_tx.send_replace(true);
                            }
                        }
                        Some(Err(e)) if current => {
                            self.retries.fetch_add(1, Ordering::SeqCst);
                            let delay = Self::retry_delay();
                            tracing::error!(sink = sink_type, error = %e, backoff = ?delay, "error writing token to sink");
                            let tx = work_tx.clone();
                            let cancel = cancel.clone();
                            let item = WorkItem { sink: done.sink, token: done.token };
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {
                                        let _ = tx.send(item);
                                    }
                                }
                            });
                        }
                        _ => tracing::trace!(sink = sink_type, "write for a superseded token finished"),
                    }

                    if let Some(next) = slot.deferred.take() {
                        if latest.as_deref() == Some(next.token.as_str()) {
                            self.spawn_write(&mut tasks, slot, &cancel, next);
                        }
                    }
                }
            }
        }

        tasks.shutdown().await;
        tracing::info!("sink server stopped");
        Ok(())
    }
}
