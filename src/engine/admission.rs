use std::time::Instant;

use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::occupancy::{check_capacity, validate_span};
use super::store::AdmissionTxn;
use super::{Engine, EngineError};

/// A request to occupy `spots` units of a service starting at a wall-clock
/// `date time` in the business timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen appointment id; generated when absent.
    pub id: Option<Ulid>,
    pub service_id: Ulid,
    /// `YYYY-MM-DD`.
    pub date: String,
    /// `HH:MM`.
    pub time: String,
    pub spots: u32,
    pub client_name: String,
    pub client_phone: Option<String>,
    /// Existing client to attach (dashboard bookings).
    pub client_id: Option<Ulid>,
    pub notes: Option<String>,
    pub source: BookingSource,
}

impl BookingRequest {
    pub fn online(service_id: Ulid, date: &str, time: &str, client_name: &str) -> Self {
        Self {
            id: None,
            service_id,
            date: date.to_string(),
            time: time.to_string(),
            spots: 1,
            client_name: client_name.to_string(),
            client_phone: None,
            client_id: None,
            notes: None,
            source: BookingSource::Online,
        }
    }

    pub fn manual(service_id: Ulid, date: &str, time: &str, client_name: &str) -> Self {
        Self {
            source: BookingSource::Manual,
            ..Self::online(service_id, date, time, client_name)
        }
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.client_phone = Some(phone.to_string());
        self
    }

    pub fn with_spots(mut self, spots: u32) -> Self {
        self.spots = spots;
        self
    }
}

/// Request fields that passed shape validation, with date and time parsed.
struct Validated {
    date: chrono::NaiveDate,
    time: chrono::NaiveTime,
    client_name: String,
    client_phone: Option<String>,
    notes: Option<String>,
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn validate(req: &BookingRequest) -> Result<Validated, EngineError> {
    let client_name = req.client_name.trim();
    if client_name.is_empty() {
        return Err(EngineError::invalid("client name is required"));
    }
    if client_name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid("client name too long"));
    }
    let client_phone = trimmed(req.client_phone.as_deref());
    if client_phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::invalid("client phone too long"));
    }
    let notes = trimmed(req.notes.as_deref());
    if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::invalid("notes too long"));
    }
    if req.spots == 0 {
        return Err(EngineError::invalid("spots must be at least 1"));
    }
    Ok(Validated {
        date: calendar::parse_date(&req.date)?,
        time: calendar::parse_time(&req.time)?,
        client_name: client_name.to_string(),
        client_phone,
        notes,
    })
}

fn outcome_label(result: &Result<BookingReceipt, EngineError>) -> &'static str {
    match result {
        Ok(_) => "committed",
        Err(EngineError::CapacityExceeded { .. }) => "capacity_exceeded",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::InvalidArgument(_)) => "invalid",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::StoreUnavailable(_)) => "store_unavailable",
    }
}

impl Engine {
    /// Admit a booking: validate, then check and record occupancy under the
    /// service's admission transaction so concurrent requests for the same
    /// interval can never jointly exceed capacity.
    pub async fn admit(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let started = Instant::now();
        let source = req.source;
        let service_id = req.service_id;
        let result = self.admit_inner(req).await;

        metrics::counter!(
            observability::BOOKINGS_TOTAL,
            "source" => source.as_str(),
            "outcome" => outcome_label(&result),
        )
        .increment(1);
        metrics::histogram!(observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => tracing::info!(
                "booked {} on service {service_id} ({}, {})",
                receipt.appointment_id,
                source.as_str(),
                receipt.status.as_str()
            ),
            Err(e) if e.is_business_outcome() => {
                tracing::debug!("booking on service {service_id} rejected: {e}")
            }
            Err(e @ EngineError::StoreUnavailable(_)) => {
                tracing::error!("booking on service {service_id} not persisted: {e}")
            }
            Err(e) => tracing::debug!("booking on service {service_id} refused: {e}"),
        }
        result
    }

    async fn admit_inner(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let v = validate(&req)?;
        let (_, tz) = self.business_tz().await?;
        let start = calendar::to_instant(v.date, v.time, tz)?;
        let hours = self.hours_for(calendar::day_of_week(v.date)).await;

        let mut txn = self.begin_admission(&req.service_id).await?;
        let service = txn.service().clone();
        if !service.active {
            return Err(EngineError::not_found("service", req.service_id));
        }
        if req.spots > service.capacity {
            return Err(EngineError::invalid(format!(
                "spots must be between 1 and {}",
                service.capacity
            )));
        }
        let span = Span::new(start, start + service.duration_ms());
        validate_span(&span)?;

        if req.source == BookingSource::Online {
            if start <= self.now_ms() {
                return Err(EngineError::invalid("slot is in the past"));
            }
            let open = match hours.filter(|h| h.active) {
                Some(h) => Span::try_new(
                    calendar::to_instant_or_after(v.date, h.start, tz)?,
                    calendar::to_instant_or_after(v.date, h.end, tz)?,
                ),
                None => None,
            };
            if !open.is_some_and(|o| o.contains_span(&span)) {
                return Err(EngineError::invalid("outside working hours"));
            }
        }

        if txn.appointment_count() >= MAX_APPOINTMENTS_PER_SERVICE {
            return Err(EngineError::invalid("service has too many appointments"));
        }
        let index = txn.occupancy(&span);
        check_capacity(&index, &span, req.spots, service.capacity)?;

        // Held until the booking is applied so two admissions cannot both
        // create a client for the same phone.
        let _client_gate = self.bounded("client", self.client_gate.lock()).await?;
        let (client_id, new_client) = self.resolve_client(&req, &v)?;

        let appointment = Appointment {
            id: req.id.unwrap_or_else(Ulid::new),
            service_id: service.id,
            client_id: Some(client_id),
            client_name: v.client_name,
            client_phone: v.client_phone,
            span,
            status: req.source.initial_status(),
            spots: req.spots,
            source: req.source,
            notes: v.notes,
            created_at: self.now_ms(),
        };
        if self.appointment_to_service.contains_key(&appointment.id) {
            return Err(EngineError::invalid("appointment already exists"));
        }
        let receipt = BookingReceipt {
            appointment_id: appointment.id,
            status: appointment.status,
            span,
            payment_required: service.requires_payment,
        };

        self.commit_booking(&mut txn, appointment, new_client).await?;
        Ok(receipt)
    }

    async fn commit_booking(
        &self,
        txn: &mut AdmissionTxn,
        appointment: Appointment,
        new_client: Option<Client>,
    ) -> Result<(), EngineError> {
        let event = Event::AppointmentBooked {
            appointment,
            new_client,
        };
        self.commit_admission(txn, &event).await
    }

    /// The client this booking belongs to: the explicit one, the existing
    /// client with the same phone, or a new record. Callers hold `client_gate`.
    fn resolve_client(
        &self,
        req: &BookingRequest,
        v: &Validated,
    ) -> Result<(Ulid, Option<Client>), EngineError> {
        if let Some(id) = req.client_id {
            if !self.clients.contains_key(&id) {
                return Err(EngineError::not_found("client", id));
            }
            return Ok((id, None));
        }
        if let Some(phone) = &v.client_phone
            && let Some(existing) = self.clients_by_phone.get(phone)
        {
            return Ok((*existing.value(), None));
        }
        if self.clients.len() >= MAX_CLIENTS_PER_BUSINESS {
            return Err(EngineError::invalid("too many clients"));
        }
        let client = Client {
            id: Ulid::new(),
            name: v.client_name.clone(),
            phone: v.client_phone.clone(),
            email: None,
            notes: None,
        };
        Ok((client.id, Some(client)))
    }
}
