mod admission;
mod availability;
mod error;
mod mutations;
mod occupancy;
mod queries;
mod store;

pub use admission::BookingRequest;
pub use availability::compute_slots;
pub use error::{EngineError, SLOT_TAKEN_MESSAGE};
pub use mutations::{AppointmentPatch, ServicePatch};
pub use occupancy::{OccupancyIndex, OccupancyKind, OccupancySpan};
pub use store::{AdmissionTxn, StateImage};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::calendar;
use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<ServiceLedger>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up takes the first append plus everything already
/// queued behind it, writes them all, and pays for a single fsync.
async fn group_commit_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            control => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    // Compaction must observe every append queued before it.
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch is reported to every caller, so none of it may survive
    // a restart either.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("wal rollback failed, refusing further appends: {e}");
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal commit of {} event(s) failed: {e}", batch.len());
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {
            tracing::error!("append routed to control handler");
        }
    }
}

/// One business's booking state: profile, schedule, services with their
/// appointment ledgers, time blocks and clients.
pub struct Engine {
    pub(super) profile: RwLock<Option<BusinessProfile>>,
    /// Indexed by day of week, 0 = Sunday.
    pub(super) hours: RwLock<[Option<WorkingHours>; 7]>,
    pub(super) services: DashMap<Ulid, SharedLedger>,
    pub(super) blocks: Arc<RwLock<BlockSet>>,
    pub(super) clients: DashMap<Ulid, Client>,
    pub(super) clients_by_phone: DashMap<String, Ulid>,
    /// Reverse lookup: appointment id → service id.
    pub(super) appointment_to_service: DashMap<Ulid, Ulid>,
    /// Serializes client creation so phone deduplication holds across services.
    pub(super) client_gate: Mutex<()>,
    /// Held shared by every mutation and exclusively by compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) lock_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(group_commit_loop(wal, wal_rx));

        let mut image = StateImage::default();
        for event in &events {
            image.apply(event);
        }
        tracing::debug!(
            "replayed {} event(s) from {}",
            events.len(),
            wal_path.display()
        );

        Ok(Self::from_image(image, wal_tx, clock))
    }

    fn from_image(image: StateImage, wal_tx: mpsc::Sender<WalCommand>, clock: Arc<dyn Clock>) -> Self {
        let engine = Self {
            profile: RwLock::new(image.profile),
            hours: RwLock::new(image.hours),
            services: DashMap::new(),
            blocks: Arc::new(RwLock::new(image.blocks)),
            clients: DashMap::new(),
            clients_by_phone: DashMap::new(),
            appointment_to_service: DashMap::new(),
            client_gate: Mutex::new(()),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };
        for (id, ledger) in image.ledgers {
            for appointment in &ledger.appointments {
                engine.appointment_to_service.insert(appointment.id, id);
            }
            engine.services.insert(id, Arc::new(RwLock::new(ledger)));
        }
        for (id, client) in image.clients {
            if let Some(phone) = &client.phone {
                engine.clients_by_phone.insert(phone.clone(), id);
            }
            engine.clients.insert(id, client);
        }
        engine
    }

    /// Upper bound on how long an admission waits for its locks before
    /// giving up with `Conflict`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))
    }

    pub fn get_ledger(&self, service_id: &Ulid) -> Option<SharedLedger> {
        self.services.get(service_id).map(|e| e.value().clone())
    }

    pub(super) fn ledger(&self, service_id: &Ulid) -> Result<SharedLedger, EngineError> {
        self.get_ledger(service_id)
            .ok_or_else(|| EngineError::not_found("service", service_id))
    }

    pub fn service_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_service
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// The business profile and its parsed timezone. Without a profile the
    /// business has not been onboarded and does not exist for callers.
    pub(super) async fn business_tz(&self) -> Result<(BusinessProfile, Tz), EngineError> {
        let profile = self
            .profile
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::NotFound("business".into()))?;
        let tz = calendar::parse_timezone(&profile.timezone)?;
        Ok((profile, tz))
    }

    pub(super) async fn hours_for(&self, day_of_week: u8) -> Option<WorkingHours> {
        self.hours
            .read()
            .await
            .get(day_of_week as usize)
            .copied()
            .flatten()
    }

    /// Await a lock acquisition, bounded by the engine's lock timeout.
    pub(super) async fn bounded<F: std::future::Future>(
        &self,
        what: &str,
        fut: F,
    ) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.lock_timeout, fut)
            .await
            .map_err(|_| EngineError::Conflict(format!("timed out waiting for {what} lock")))
    }

    /// Keep the secondary indexes in step with an event already applied to
    /// the ledgers and block set.
    pub(super) fn index_event(&self, event: &Event) {
        match event {
            Event::ClientCreated { client }
            | Event::AppointmentBooked {
                new_client: Some(client),
                ..
            } => {
                if let Some(phone) = &client.phone {
                    self.clients_by_phone.insert(phone.clone(), client.id);
                }
                self.clients.insert(client.id, client.clone());
            }
            Event::ClientDeleted { id } => {
                if let Some((_, client)) = self.clients.remove(id)
                    && let Some(phone) = client.phone
                {
                    self.clients_by_phone.remove_if(&phone, |_, owner| owner == id);
                }
            }
            _ => {}
        }
        match event {
            Event::AppointmentBooked { appointment, .. } => {
                self.appointment_to_service
                    .insert(appointment.id, appointment.service_id);
            }
            Event::AppointmentDeleted { id, .. } => {
                self.appointment_to_service.remove(id);
            }
            _ => {}
        }
    }
}
