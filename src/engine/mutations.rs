use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::occupancy::{OccupancyIndex, validate_span};
use super::store::{apply_to_blocks, apply_to_ledger};
use super::{Engine, EngineError, WalCommand};

/// Partial update of a service. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub duration_minutes: Option<u32>,
    pub capacity: Option<u32>,
    pub price_cents: Option<Option<i64>>,
    pub requires_payment: Option<bool>,
    pub active: Option<bool>,
}

/// Dashboard edit of an appointment. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub status: Option<AppointmentStatus>,
    pub notes: Option<Option<String>>,
}

fn validate_service(service: &Service) -> Result<(), EngineError> {
    if service.name.trim().is_empty() {
        return Err(EngineError::invalid("service name is required"));
    }
    if service.name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid("service name too long"));
    }
    if !(1..=MAX_SERVICE_DURATION_MINUTES).contains(&service.duration_minutes) {
        return Err(EngineError::invalid(format!(
            "duration must be between 1 and {MAX_SERVICE_DURATION_MINUTES} minutes"
        )));
    }
    if !(1..=MAX_SERVICE_CAPACITY).contains(&service.capacity) {
        return Err(EngineError::invalid(format!(
            "capacity must be between 1 and {MAX_SERVICE_CAPACITY}"
        )));
    }
    if service.price_cents.is_some_and(|p| p < 0) {
        return Err(EngineError::invalid("price cannot be negative"));
    }
    Ok(())
}

impl Engine {
    // ── Business ─────────────────────────────────────────────

    pub async fn configure_business(&self, profile: BusinessProfile) -> Result<(), EngineError> {
        if profile.name.trim().is_empty() {
            return Err(EngineError::invalid("business name is required"));
        }
        if profile.name.len() > MAX_NAME_LEN {
            return Err(EngineError::invalid("business name too long"));
        }
        calendar::parse_timezone(&profile.timezone)?;

        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::BusinessConfigured {
            profile: profile.clone(),
        })
        .await?;
        tracing::info!("business '{}' configured ({})", profile.name, profile.timezone);
        *self.profile.write().await = Some(profile);
        Ok(())
    }

    /// Replace the opening hours for one weekday.
    pub async fn set_working_hours(&self, hours: WorkingHours) -> Result<(), EngineError> {
        if hours.day_of_week > 6 {
            return Err(EngineError::invalid("day_of_week must be 0 (Sunday) to 6"));
        }
        if hours.active && hours.start >= hours.end {
            return Err(EngineError::invalid("opening time must be before closing time"));
        }

        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::WorkingHoursSet { hours }).await?;
        self.hours.write().await[hours.day_of_week as usize] = Some(hours);
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────

    pub async fn create_service(&self, service: Service) -> Result<Service, EngineError> {
        validate_service(&service)?;
        if self.services.len() >= MAX_SERVICES_PER_BUSINESS {
            return Err(EngineError::invalid("too many services"));
        }
        if self.services.contains_key(&service.id) {
            return Err(EngineError::invalid(format!("service {} already exists", service.id)));
        }

        let _gate = self.commit_gate.read().await;
        let event = Event::ServiceCreated {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        self.services.insert(
            service.id,
            Arc::new(RwLock::new(ServiceLedger::new(service.clone()))),
        );
        Ok(service)
    }

    /// Edit a service. Existing appointments keep the span they were admitted
    /// with; capacity cannot drop below what upcoming appointments already hold.
    pub async fn update_service(&self, id: Ulid, patch: ServicePatch) -> Result<Service, EngineError> {
        let ledger = self.ledger(&id)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.bounded("service", ledger.write()).await?;

        let mut service = guard.service.clone();
        if let Some(name) = patch.name {
            service.name = name.trim().to_string();
        }
        if let Some(duration) = patch.duration_minutes {
            service.duration_minutes = duration;
        }
        if let Some(capacity) = patch.capacity {
            service.capacity = capacity;
        }
        if let Some(price) = patch.price_cents {
            service.price_cents = price;
        }
        if let Some(requires_payment) = patch.requires_payment {
            service.requires_payment = requires_payment;
        }
        if let Some(active) = patch.active {
            service.active = active;
        }
        validate_service(&service)?;
        if service.capacity < guard.service.capacity {
            let now = self.now_ms();
            let upcoming =
                OccupancyIndex::appointments(&guard, &Span::new(now, MAX_VALID_TIMESTAMP_MS));
            let peak = upcoming.peak_units(now);
            if peak > service.capacity {
                return Err(EngineError::invalid(format!(
                    "capacity {} is below the {peak} spots already booked at one time",
                    service.capacity
                )));
            }
        }

        let event = Event::ServiceUpdated {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        Ok(service)
    }

    /// Remove a service that has never been booked. Booked services are
    /// deactivated instead so their history stays intact.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        let ledger = self.ledger(&id)?;
        let _gate = self.commit_gate.read().await;
        let guard = self.bounded("service", ledger.write()).await?;
        if !guard.appointments.is_empty() {
            return Err(EngineError::invalid(
                "service has appointments; deactivate it instead",
            ));
        }

        self.wal_append(&Event::ServiceDeleted { id }).await?;
        self.services.remove(&id);
        Ok(())
    }

    // ── Time blocks ──────────────────────────────────────────

    pub async fn add_time_block(&self, block: TimeBlock) -> Result<(), EngineError> {
        validate_span(&block.span)?;
        if block.span.duration_ms() > MAX_BLOCK_DURATION_MS {
            return Err(EngineError::invalid("time block longer than a year"));
        }
        if block.title.len() > MAX_NAME_LEN {
            return Err(EngineError::invalid("time block title too long"));
        }

        let _gate = self.commit_gate.read().await;
        let mut blocks = self.bounded("time block", self.blocks.write()).await?;
        if blocks.blocks.len() >= MAX_TIME_BLOCKS {
            return Err(EngineError::invalid("too many time blocks"));
        }
        if blocks.contains(&block.id) {
            return Err(EngineError::invalid(format!("time block {} already exists", block.id)));
        }

        let event = Event::TimeBlockAdded { block };
        self.wal_append(&event).await?;
        apply_to_blocks(&mut blocks, &event);
        Ok(())
    }

    pub async fn remove_time_block(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut blocks = self.bounded("time block", self.blocks.write()).await?;
        if !blocks.contains(&id) {
            return Err(EngineError::not_found("time block", id));
        }

        let event = Event::TimeBlockRemoved { id };
        self.wal_append(&event).await?;
        apply_to_blocks(&mut blocks, &event);
        Ok(())
    }

    // ── Clients ──────────────────────────────────────────────

    pub async fn create_client(&self, mut client: Client) -> Result<Client, EngineError> {
        client.name = client.name.trim().to_string();
        client.phone = client
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if client.name.is_empty() {
            return Err(EngineError::invalid("client name is required"));
        }
        if client.name.len() > MAX_NAME_LEN
            || client.phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN)
            || client.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN)
        {
            return Err(EngineError::invalid("client field too long"));
        }

        let _gate = self.commit_gate.read().await;
        let _clients = self.bounded("client", self.client_gate.lock()).await?;
        if self.clients.len() >= MAX_CLIENTS_PER_BUSINESS {
            return Err(EngineError::invalid("too many clients"));
        }
        if self.clients.contains_key(&client.id) {
            return Err(EngineError::invalid(format!("client {} already exists", client.id)));
        }
        if let Some(phone) = &client.phone
            && self.clients_by_phone.contains_key(phone)
        {
            return Err(EngineError::invalid("a client with this phone already exists"));
        }

        let event = Event::ClientCreated {
            client: client.clone(),
        };
        self.wal_append(&event).await?;
        self.index_event(&event);
        Ok(client)
    }

    /// Forget a client. Their appointments keep the name and phone they were
    /// booked with.
    pub async fn delete_client(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _clients = self.bounded("client", self.client_gate.lock()).await?;
        if !self.clients.contains_key(&id) {
            return Err(EngineError::not_found("client", id));
        }

        let event = Event::ClientDeleted { id };
        self.wal_append(&event).await?;
        self.index_event(&event);
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    /// Change status and/or notes. Status only moves forward; neither change
    /// re-checks capacity.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        if patch
            .notes
            .as_ref()
            .is_some_and(|n| n.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN))
        {
            return Err(EngineError::invalid("notes too long"));
        }
        let service_id = self
            .service_for_appointment(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let ledger = self.ledger(&service_id)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.bounded("service", ledger.write()).await?;

        let current = guard
            .appointment_mut(id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?
            .clone();
        let status = patch.status.unwrap_or(current.status);
        if status != current.status && !current.status.can_transition_to(status) {
            return Err(EngineError::invalid(format!(
                "cannot move appointment from {} to {}",
                current.status.as_str(),
                status.as_str()
            )));
        }
        let notes = patch.notes.unwrap_or(current.notes);

        let event = Event::AppointmentUpdated {
            id,
            service_id,
            status,
            notes,
        };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        guard
            .appointment_mut(id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let service_id = self
            .service_for_appointment(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let ledger = self.ledger(&service_id)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.bounded("service", ledger.write()).await?;

        let event = Event::AppointmentDeleted { id, service_id };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        self.index_event(&event);
        Ok(())
    }

    // ── Log maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    /// Writers are paused for the duration so the captured image and the
    /// log never disagree.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.capture_image().await.to_events();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        tracing::debug!("wal compacted to {count} event(s)");
        Ok(())
    }
}
