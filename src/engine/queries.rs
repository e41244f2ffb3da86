use ulid::Ulid;

use crate::limits::MAX_LISTING_WINDOW_MS;
use crate::model::*;

use super::{Engine, EngineError};

fn listing_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = Span::try_new(start, end)
        .ok_or_else(|| EngineError::invalid("listing window must end after it starts"))?;
    if window.duration_ms() > MAX_LISTING_WINDOW_MS {
        return Err(EngineError::invalid("listing window too wide"));
    }
    Ok(window)
}

impl Engine {
    pub async fn business_profile(&self) -> Option<BusinessProfile> {
        self.profile.read().await.clone()
    }

    /// Configured weekdays, Sunday first.
    pub async fn working_hours(&self) -> Vec<WorkingHours> {
        self.hours.read().await.iter().flatten().copied().collect()
    }

    pub async fn get_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let ledger = self.ledger(&id)?;
        let guard = ledger.read().await;
        Ok(guard.service.clone())
    }

    /// All services, inactive ones included, ordered by name.
    pub async fn list_services(&self) -> Vec<Service> {
        let ledgers: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut services = Vec::with_capacity(ledgers.len());
        for ledger in ledgers {
            services.push(ledger.read().await.service.clone());
        }
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    pub fn get_client(&self, id: Ulid) -> Result<Client, EngineError> {
        self.clients
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("client", id))
    }

    pub fn list_clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        clients
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let service_id = self
            .service_for_appointment(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let ledger = self.ledger(&service_id)?;
        let guard = ledger.read().await;
        guard
            .appointments
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Appointments of every service overlapping `[start, end)`, cancelled
    /// ones included, ordered by start.
    pub async fn list_appointments(&self, start: Ms, end: Ms) -> Result<Vec<Appointment>, EngineError> {
        let window = listing_window(start, end)?;
        let ledgers: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            out.extend(guard.overlapping(&window).cloned());
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        Ok(out)
    }

    pub async fn list_time_blocks(&self, start: Ms, end: Ms) -> Result<Vec<TimeBlock>, EngineError> {
        let window = listing_window(start, end)?;
        let blocks = self.blocks.read().await;
        Ok(blocks.overlapping(&window).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_window_bounds() {
        assert!(listing_window(10, 10).is_err());
        assert!(listing_window(0, MAX_LISTING_WINDOW_MS).is_ok());
        assert!(listing_window(0, MAX_LISTING_WINDOW_MS + 1).is_err());
    }
}
