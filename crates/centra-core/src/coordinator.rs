// ── State coordinator ──
//
// Owns the canonical snapshot of every instance record, merges full
// polls and incremental push deltas via copy-on-write, derives
// aggregate fields, and dispatches commands through the translator.
//
// Concurrency discipline: the snapshot slot is swap-not-mutate. A
// refresh builds a complete new snapshot and swaps it in; a push update
// builds a successor with one record replaced and installs it with a
// compare-and-swap against the snapshot the merge was taken from. When
// a concurrent refresh wins the race, the update re-resolves against
// the new snapshot instead of applying a stale copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use centra_api::transport::TransportConfig;
use centra_api::wire::WireInstance;
use centra_api::{PollClient, PushEvent, SessionManager, SocketClient, SocketConfig};

use crate::aggregate;
use crate::catalog::FieldCatalog;
use crate::channel::{PushChannel, StatelessChannel};
use crate::command::{self, Command, DispatchRoute};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::model::{DeviceKind, FieldValue, InstanceRecord};
use crate::store::Snapshot;

/// Give up applying one update after this many snapshot races.
const MAX_MERGE_RETRIES: u32 = 8;

/// Canonical field carrying the derived daily meter consumption.
const ENERGY_TODAY_FIELD: &str = "energy_today";

enum UpdateOutcome {
    Applied,
    UnknownInstance,
    RacedOut,
}

/// The state synchronization and command dispatch core for one
/// controller connection.
///
/// Cheaply cloneable; clones share the snapshot, channels, and
/// background tasks.
pub struct Coordinator<P, S> {
    inner: Arc<CoordinatorInner<P, S>>,
}

impl<P, S> Clone for Coordinator<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CoordinatorInner<P, S> {
    push: P,
    stateless: S,
    catalog: FieldCatalog,
    snapshot: ArcSwap<Snapshot>,
    refreshed: watch::Sender<Option<DateTime<Utc>>>,
    /// Pinged when a push update arrives for an undiscovered instance.
    refresh_wanted: Notify,
    poll_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: PushChannel, S: StatelessChannel> Coordinator<P, S> {
    pub fn new(push: P, stateless: S, catalog: FieldCatalog, poll_interval: Duration) -> Self {
        let (refreshed, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                push,
                stateless,
                catalog,
                snapshot: ArcSwap::from_pointee(Snapshot::empty()),
                refreshed,
                refresh_wanted: Notify::new(),
                poll_interval,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn push_channel(&self) -> &P {
        &self.inner.push
    }

    pub fn stateless_channel(&self) -> &S {
        &self.inner.stateless
    }

    // ── Reads ────────────────────────────────────────────────────

    /// A stable, read-only reference to one record, or absent.
    pub fn get(&self, entity_type: &str, instance_id: &str) -> Option<Arc<InstanceRecord>> {
        self.inner
            .snapshot
            .load()
            .get(entity_type, instance_id)
            .cloned()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    /// Refresh-completed notifications.
    pub fn refreshed(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.inner.refreshed.subscribe()
    }

    // ── Polling ──────────────────────────────────────────────────

    /// One full poll per entity type; the result replaces the held
    /// snapshot wholesale.
    ///
    /// The new snapshot, index included, is built completely before the
    /// swap -- readers either see the old consistent view or the new
    /// one, never a half-built one.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let catalog = &self.inner.catalog;
        let mut lists = HashMap::new();

        for entity_type in catalog.entity_types() {
            let wire = self.inner.stateless.fetch_instances(entity_type).await?;
            let records: Vec<Arc<InstanceRecord>> = wire
                .into_iter()
                .filter_map(|w| build_record(catalog, entity_type, w))
                .map(Arc::new)
                .collect();
            debug!(
                entity_type = %entity_type,
                count = records.len(),
                "polled entity type"
            );
            lists.insert(entity_type.clone(), records);
        }

        self.inner.snapshot.store(Arc::new(Snapshot::from_lists(lists)));
        let _ = self.inner.refreshed.send(Some(Utc::now()));
        Ok(())
    }

    // ── Push deltas ──────────────────────────────────────────────

    /// Merge one push event into the held snapshot, copy-on-write.
    ///
    /// Unknown instances are logged and dropped (the poll has not
    /// discovered them yet) and a refresh is scheduled for the next
    /// cycle; this is never an error to the caller.
    pub fn apply_push_update(&self, event: &PushEvent) {
        let catalog = &self.inner.catalog;
        let outcome = self.update_record(&event.instance_id, |current| {
            merge_push(catalog, current, event)
        });

        match outcome {
            UpdateOutcome::Applied => {}
            UpdateOutcome::UnknownInstance => {
                debug!(
                    instance_id = %event.instance_id,
                    "push update for unknown instance, dropping"
                );
                self.inner.refresh_wanted.notify_one();
            }
            UpdateOutcome::RacedOut => warn!(
                instance_id = %event.instance_id,
                "dropping push update after repeated snapshot races"
            ),
        }
    }

    /// Replace one record's slot through the compare-and-swap loop.
    ///
    /// Each iteration re-captures the current snapshot and re-resolves
    /// the record, so a rebuild is never applied against a snapshot it
    /// was not taken from.
    fn update_record(
        &self,
        instance_id: &str,
        rebuild: impl Fn(&InstanceRecord) -> InstanceRecord,
    ) -> UpdateOutcome {
        let mut attempts = 0;
        loop {
            let snap = self.inner.snapshot.load_full();
            let Some(current) = snap.resolve(instance_id) else {
                return UpdateOutcome::UnknownInstance;
            };

            let next = Arc::new(snap.with_record(Arc::new(rebuild(current))));
            let prev = self.inner.snapshot.compare_and_swap(&snap, next);
            if Arc::ptr_eq(&*prev, &snap) {
                return UpdateOutcome::Applied;
            }

            // A concurrent refresh replaced the snapshot mid-merge;
            // retry against the one it installed.
            attempts += 1;
            if attempts > MAX_MERGE_RETRIES {
                return UpdateOutcome::RacedOut;
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Execute a command against its instance.
    ///
    /// Dispatch goes through the translator: push channel when its
    /// preconditions hold, stateless fallback otherwise. No poll is
    /// forced afterwards -- confirmation arrives as a push delta, and an
    /// eager poll can race ahead of that delta and resurrect the
    /// pre-command value.
    pub async fn execute(&self, command: Command) -> Result<DispatchRoute, CoreError> {
        let record = self
            .inner
            .snapshot
            .load()
            .resolve(command.instance_id())
            .cloned()
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: command.instance_id().to_owned(),
            })?;

        command::dispatch(&self.inner.push, &self.inner.stateless, &record, &command).await
    }

    // ── Derived "today" values ───────────────────────────────────

    /// Correlate every meter against the history source and derive the
    /// daily consumption field.
    ///
    /// One batched query covers all meters per cycle -- never one query
    /// per instance, which starves the shared executor under load.
    pub async fn refresh_daily_totals(&self) -> Result<(), CoreError> {
        let snap = self.inner.snapshot.load_full();
        let meters: Vec<String> = snap
            .iter()
            .filter(|r| r.kind == DeviceKind::Meter)
            .map(|r| r.instance_id.clone())
            .collect();
        if meters.is_empty() {
            return Ok(());
        }

        let deltas = self
            .inner
            .stateless
            .fetch_history(meters, start_of_today())
            .await?;

        for (instance_id, history) in deltas {
            self.update_record(&instance_id, |current| {
                current.with_changes(
                    [(
                        ENERGY_TODAY_FIELD.to_owned(),
                        FieldValue::Number(history.delta),
                    )],
                    None,
                )
            });
        }
        Ok(())
    }

    // ── Background tasks ─────────────────────────────────────────

    /// Spawn the poll cycle and the push-dispatch loop.
    ///
    /// Both run as independently scheduled tasks on the shared runtime;
    /// a poll suspended on I/O never stalls push dispatch, which is why
    /// a push update can land mid-poll in the first place.
    pub async fn start(&self, mut events: mpsc::Receiver<PushEvent>) {
        let mut tasks = self.inner.tasks.lock().await;

        let dispatcher = self.clone();
        let cancel = self.inner.cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        dispatcher.apply_push_update(&event);
                    }
                }
            }
        }));

        if !self.inner.poll_interval.is_zero() {
            let poller = self.clone();
            let cancel = self.inner.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(poller.inner.poll_interval);
                interval.tick().await; // consume the immediate first tick
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => poller.poll_cycle().await,
                        _ = poller.inner.refresh_wanted.notified() => poller.poll_cycle().await,
                    }
                }
            }));
        }
    }

    async fn poll_cycle(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "scheduled refresh failed");
            return;
        }
        if let Err(e) = self.refresh_daily_totals().await {
            warn!(error = %e, "history correlation failed");
        }
    }

    /// Cancel and join the background tasks.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Coordinator<SocketClient, PollClient> {
    /// Wire up the full client stack for one controller: a shared
    /// session, the stateless channel, and the push socket.
    pub fn for_controller(
        config: &ControllerConfig,
        catalog: FieldCatalog,
    ) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            tls: config.tls.clone(),
            timeout: config.timeout,
        };
        let session = Arc::new(SessionManager::new(
            &config.url,
            config.credentials.clone(),
            &transport,
        )?);
        let stateless = PollClient::new(&config.url, Arc::clone(&session), &transport)?;
        let push = SocketClient::new(SocketConfig::for_controller(&config.url)?, session);

        Ok(Self::new(
            push,
            stateless,
            catalog,
            Duration::from_secs(config.poll_interval_secs),
        ))
    }
}

// ── Record construction & merging ────────────────────────────────────

/// Build one record from a polled wire instance.
fn build_record(
    catalog: &FieldCatalog,
    entity_type: &str,
    wire: WireInstance,
) -> Option<InstanceRecord> {
    let Ok(kind) = wire.kind.parse::<DeviceKind>() else {
        warn!(
            instance_id = %wire.instance_id,
            kind = %wire.kind,
            "unknown device kind, skipping instance"
        );
        return None;
    };

    let mut fields = std::collections::BTreeMap::new();
    for (wire_name, value) in &wire.properties {
        let Some(canonical) = catalog.canonical_field(kind, wire_name) else {
            debug!(field = %wire_name, "unmapped wire field, skipping");
            continue;
        };
        let Some(field_value) = FieldValue::from_wire(value) else {
            debug!(field = %wire_name, "non-scalar wire value, skipping");
            continue;
        };
        fields.insert(canonical.to_owned(), field_value);
    }
    aggregate::recompute(kind, &mut fields);

    Some(InstanceRecord {
        entity_type: entity_type.to_owned(),
        instance_id: wire.instance_id,
        kind,
        fields,
        updated_at: None,
    })
}

/// Shallow-copy `current` with the event's deltas merged in, wire field
/// names translated to canonical ones, aggregates recomputed.
fn merge_push(
    catalog: &FieldCatalog,
    current: &InstanceRecord,
    event: &PushEvent,
) -> InstanceRecord {
    let mut changes = Vec::new();
    let mut stamp: Option<DateTime<Utc>> = None;

    for (wire_name, push_value) in &event.changes {
        let Some(canonical) = catalog.canonical_field(current.kind, wire_name) else {
            debug!(field = %wire_name, "unmapped push field, skipping");
            continue;
        };
        let Some(value) = FieldValue::from_wire(&push_value.value) else {
            debug!(field = %wire_name, "non-scalar push value, skipping");
            continue;
        };
        if let Some(ts) = push_value.timestamp {
            stamp = Some(stamp.map_or(ts, |s| s.max(ts)));
        }
        changes.push((canonical.to_owned(), value));
    }

    let mut updated = current.with_changes(changes, stamp);
    aggregate::recompute(updated.kind, &mut updated.fields);
    updated
}

fn start_of_today() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}
