use std::collections::HashMap;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::model::*;

use super::occupancy::OccupancyIndex;
use super::{Engine, EngineError};

/// Plain, lock-free copy of a business's state. Replay folds the log into one
/// of these before the engine wraps it; compaction captures one and writes it
/// back out as the shortest event list that recreates it.
#[derive(Debug, Clone, Default)]
pub struct StateImage {
    pub profile: Option<BusinessProfile>,
    pub hours: [Option<WorkingHours>; 7],
    pub ledgers: HashMap<Ulid, ServiceLedger>,
    pub blocks: BlockSet,
    pub clients: HashMap<Ulid, Client>,
}

impl StateImage {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BusinessConfigured { profile } => self.profile = Some(profile.clone()),
            Event::WorkingHoursSet { hours } => {
                if let Some(slot) = self.hours.get_mut(hours.day_of_week as usize) {
                    *slot = Some(*hours);
                }
            }
            Event::ServiceCreated { service } => {
                self.ledgers
                    .insert(service.id, ServiceLedger::new(service.clone()));
            }
            Event::ServiceDeleted { id } => {
                self.ledgers.remove(id);
            }
            Event::TimeBlockAdded { .. } | Event::TimeBlockRemoved { .. } => {
                apply_to_blocks(&mut self.blocks, event)
            }
            Event::ClientCreated { client } => {
                self.clients.insert(client.id, client.clone());
            }
            Event::ClientDeleted { id } => {
                self.clients.remove(id);
            }
            Event::AppointmentBooked {
                appointment,
                new_client,
            } => {
                if let Some(client) = new_client {
                    self.clients.insert(client.id, client.clone());
                }
                if let Some(ledger) = self.ledgers.get_mut(&appointment.service_id) {
                    apply_to_ledger(ledger, event);
                }
            }
            Event::ServiceUpdated { service } => {
                if let Some(ledger) = self.ledgers.get_mut(&service.id) {
                    apply_to_ledger(ledger, event);
                }
            }
            Event::AppointmentUpdated { service_id, .. }
            | Event::AppointmentDeleted { service_id, .. } => {
                if let Some(ledger) = self.ledgers.get_mut(service_id) {
                    apply_to_ledger(ledger, event);
                }
            }
        }
    }

    /// Events that rebuild this image from an empty log.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(profile) = &self.profile {
            events.push(Event::BusinessConfigured {
                profile: profile.clone(),
            });
        }
        for hours in self.hours.iter().flatten() {
            events.push(Event::WorkingHoursSet { hours: *hours });
        }
        for client in self.clients.values() {
            events.push(Event::ClientCreated {
                client: client.clone(),
            });
        }
        for ledger in self.ledgers.values() {
            events.push(Event::ServiceCreated {
                service: ledger.service.clone(),
            });
            for appointment in &ledger.appointments {
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                    new_client: None,
                });
            }
        }
        for block in &self.blocks.blocks {
            events.push(Event::TimeBlockAdded {
                block: block.clone(),
            });
        }
        events
    }
}

/// Apply an event scoped to one service ledger. Other events are ignored.
pub(super) fn apply_to_ledger(ledger: &mut ServiceLedger, event: &Event) {
    match event {
        Event::ServiceUpdated { service } => ledger.service = service.clone(),
        Event::AppointmentBooked { appointment, .. } => {
            ledger.insert_appointment(appointment.clone())
        }
        Event::AppointmentUpdated {
            id, status, notes, ..
        } => {
            if let Some(a) = ledger.appointment_mut(*id) {
                a.status = *status;
                a.notes = notes.clone();
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            ledger.remove_appointment(*id);
        }
        _ => {}
    }
}

pub(super) fn apply_to_blocks(blocks: &mut BlockSet, event: &Event) {
    match event {
        Event::TimeBlockAdded { block } => blocks.insert(block.clone()),
        Event::TimeBlockRemoved { id } => {
            blocks.remove(*id);
        }
        _ => {}
    }
}

/// Exclusive hold on one service's ledger for the read-check-write of a
/// single admission, with the business's blocks pinned for reading.
///
/// Field order is drop order: the ledger is released first, the commit gate last.
pub struct AdmissionTxn {
    ledger: OwnedRwLockWriteGuard<ServiceLedger>,
    blocks: OwnedRwLockReadGuard<BlockSet>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl AdmissionTxn {
    pub fn service(&self) -> &Service {
        &self.ledger.service
    }

    pub fn appointment_count(&self) -> usize {
        self.ledger.appointments.len()
    }

    /// Occupancy of `window` as of this transaction. Stable until commit.
    pub fn occupancy(&self, window: &Span) -> OccupancyIndex {
        OccupancyIndex::collect(&self.ledger, &self.blocks, window)
    }
}

impl Engine {
    /// Take the commit gate, the block set and the service ledger in that
    /// order. Waiting longer than the lock timeout on any of them is a
    /// `Conflict`.
    pub(super) async fn begin_admission(
        &self,
        service_id: &Ulid,
    ) -> Result<AdmissionTxn, EngineError> {
        let ledger = self.ledger(service_id)?;
        let gate = self
            .bounded("commit", self.commit_gate.clone().read_owned())
            .await?;
        let blocks = self
            .bounded("time block", self.blocks.clone().read_owned())
            .await?;
        let ledger = self.bounded("service", ledger.write_owned()).await?;
        // Deleted while we waited.
        if !self.services.contains_key(service_id) {
            return Err(EngineError::not_found("service", service_id));
        }
        Ok(AdmissionTxn {
            ledger,
            blocks,
            _gate: gate,
        })
    }

    /// Make the admission durable, then visible. On a WAL failure nothing
    /// in memory changes.
    pub(super) async fn commit_admission(
        &self,
        txn: &mut AdmissionTxn,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(&mut txn.ledger, event);
        self.index_event(event);
        Ok(())
    }

    /// Consistent read of one service and its occupancy over `window`.
    pub(super) async fn read_snapshot(
        &self,
        service_id: &Ulid,
        window: &Span,
    ) -> Result<(Service, OccupancyIndex), EngineError> {
        let ledger = self.ledger(service_id)?;
        let blocks = self.blocks.read().await;
        let guard = ledger.read().await;
        Ok((
            guard.service.clone(),
            OccupancyIndex::collect(&guard, &blocks, window),
        ))
    }

    /// Copy of the whole business state. Callers hold the commit gate
    /// exclusively so no write lands halfway through.
    pub(super) async fn capture_image(&self) -> StateImage {
        let mut image = StateImage {
            profile: self.profile.read().await.clone(),
            hours: *self.hours.read().await,
            blocks: self.blocks.read().await.clone(),
            ..StateImage::default()
        };
        let ledgers: Vec<_> = self
            .services
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, ledger) in ledgers {
            image.ledgers.insert(id, ledger.read().await.clone());
        }
        for entry in self.clients.iter() {
            image.clients.insert(*entry.key(), entry.value().clone());
        }
        image
    }
}
