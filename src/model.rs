use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap test used everywhere: `a1 < b2 && b1 < a2`.
    /// Spans that merely touch (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Appointment lifecycle ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    /// Whether the appointment still consumes capacity.
    pub fn occupies_capacity(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    /// Forward-only: scheduled → confirmed, and any open state → a terminal one.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        match (self, next) {
            (AppointmentStatus::Scheduled, AppointmentStatus::Confirmed) => true,
            (AppointmentStatus::Scheduled | AppointmentStatus::Confirmed, n) => n.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingSource {
    /// Entered by the business owner from the dashboard.
    Manual,
    /// Submitted through the public booking page.
    Online,
}

impl BookingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingSource::Manual => "manual",
            BookingSource::Online => "online",
        }
    }

    /// Status an appointment takes when admitted from this source.
    pub fn initial_status(&self) -> AppointmentStatus {
        match self {
            BookingSource::Manual => AppointmentStatus::Scheduled,
            BookingSource::Online => AppointmentStatus::Confirmed,
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub name: String,
    /// IANA timezone name, e.g. `America/Sao_Paulo`.
    pub timezone: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Opening hours for one day of the week (0 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub day_of_week: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    /// Units bookable at the same time (1 = exclusive).
    pub capacity: u32,
    pub price_cents: Option<i64>,
    pub requires_payment: bool,
    pub active: bool,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

/// Owner-defined no-booking interval, independent of services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBlock {
    pub id: Ulid,
    pub title: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub service_id: Ulid,
    pub client_id: Option<Ulid>,
    pub client_name: String,
    pub client_phone: Option<String>,
    /// Frozen at admission: `end = start + duration` of the service at that moment.
    pub span: Span,
    pub status: AppointmentStatus,
    pub spots: u32,
    pub source: BookingSource,
    pub notes: Option<String>,
    pub created_at: Ms,
}

// ── In-memory state ──────────────────────────────────────────────

/// One service plus every appointment ever admitted for it.
#[derive(Debug, Clone)]
pub struct ServiceLedger {
    pub service: Service,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl ServiceLedger {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps `query`, cancelled ones included.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.overlaps(query))
    }
}

/// Business-wide time blocks, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct BlockSet {
    pub blocks: Vec<TimeBlock>,
}

impl BlockSet {
    pub fn insert(&mut self, block: TimeBlock) {
        let pos = self
            .blocks
            .partition_point(|b| b.span.start <= block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<TimeBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.blocks.iter().any(|b| &b.id == id)
    }

    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &TimeBlock> {
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.overlaps(query))
    }
}

/// WAL record format. Flat, no nesting beyond entity payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessConfigured {
        profile: BusinessProfile,
    },
    WorkingHoursSet {
        hours: WorkingHours,
    },
    ServiceCreated {
        service: Service,
    },
    ServiceUpdated {
        service: Service,
    },
    ServiceDeleted {
        id: Ulid,
    },
    TimeBlockAdded {
        block: TimeBlock,
    },
    TimeBlockRemoved {
        id: Ulid,
    },
    ClientCreated {
        client: Client,
    },
    ClientDeleted {
        id: Ulid,
    },
    /// An admitted appointment, together with the client record it introduced (if any),
    /// so both land in the log atomically.
    AppointmentBooked {
        appointment: Appointment,
        new_client: Option<Client>,
    },
    AppointmentUpdated {
        id: Ulid,
        service_id: Ulid,
        status: AppointmentStatus,
        notes: Option<String>,
    },
    AppointmentDeleted {
        id: Ulid,
        service_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One bookable start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Business-local `HH:MM`.
    pub time: String,
    pub start: Ms,
    /// `capacity - occupied units`; always at least 1 for a listed slot.
    pub spots_left: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub appointment_id: Ulid,
    pub status: AppointmentStatus,
    pub span: Span,
    pub payment_required: bool,
}
