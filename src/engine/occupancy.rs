use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// What an occupancy span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyKind {
    /// A non-cancelled appointment consuming `spots` units.
    Appointment { spots: u32 },
    /// A time block: occupies the whole capacity of any service.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancySpan {
    pub span: Span,
    pub kind: OccupancyKind,
}

/// Appointments and time blocks fetched for one service over one window.
///
/// Every "is this interval taken?" question in the crate goes through here, and
/// every overlap decision goes through [`Span::overlaps`].
#[derive(Debug, Clone, Default)]
pub struct OccupancyIndex {
    /// Sorted by `span.start`.
    spans: Vec<OccupancySpan>,
}

impl OccupancyIndex {
    pub fn new(mut spans: Vec<OccupancySpan>) -> Self {
        spans.sort_by_key(|s| s.span.start);
        Self { spans }
    }

    /// Collect the spans relevant to `window`: the ledger's non-cancelled
    /// appointments and the business's blocks that overlap it.
    pub fn collect(ledger: &ServiceLedger, blocks: &BlockSet, window: &Span) -> Self {
        let appointments = ledger
            .overlapping(window)
            .filter(|a| a.status.occupies_capacity())
            .map(|a| OccupancySpan {
                span: a.span,
                kind: OccupancyKind::Appointment { spots: a.spots },
            });
        let blocked = blocks.overlapping(window).map(|b| OccupancySpan {
            span: b.span,
            kind: OccupancyKind::Block,
        });
        Self::new(appointments.chain(blocked).collect())
    }

    /// The ledger's non-cancelled appointments overlapping `window`, without
    /// any blocks.
    pub fn appointments(ledger: &ServiceLedger, window: &Span) -> Self {
        Self::collect(ledger, &BlockSet::default(), window)
    }

    /// Most units appointments hold at any single instant at or after `from`.
    /// Blocks are not counted.
    pub fn peak_units(&self, from: Ms) -> u32 {
        self.spans
            .iter()
            .filter(|s| s.span.end > from)
            .map(|s| {
                let t = s.span.start.max(from);
                let instant = Span::new(t, t + 1);
                self.overlapping(&instant)
                    .map(|o| match o.kind {
                        OccupancyKind::Appointment { spots } => spots,
                        OccupancyKind::Block => 0,
                    })
                    .fold(0u32, u32::saturating_add)
            })
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &OccupancySpan> {
        let right_bound = self.spans.partition_point(|s| s.span.start < query.end);
        self.spans[..right_bound]
            .iter()
            .filter(move |s| s.span.overlaps(query))
    }

    /// Sum of units over every span overlapping `query`. A block counts as
    /// `capacity`, so any overlap with one saturates the interval.
    pub fn occupied_units(&self, query: &Span, capacity: u32) -> u32 {
        self.overlapping(query).fold(0u32, |acc, s| {
            let units = match s.kind {
                OccupancyKind::Appointment { spots } => spots,
                OccupancyKind::Block => capacity,
            };
            acc.saturating_add(units)
        })
    }

    pub fn is_blocked(&self, query: &Span) -> bool {
        self.overlapping(query)
            .any(|s| matches!(s.kind, OccupancyKind::Block))
    }

    /// Units still bookable over `query`.
    pub fn remaining(&self, query: &Span, capacity: u32) -> u32 {
        if self.is_blocked(query) {
            return 0;
        }
        capacity.saturating_sub(self.occupied_units(query, capacity))
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::invalid("interval must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::invalid("timestamp out of range"));
    }
    Ok(())
}

/// Admission check: `requested` more units fit into `span` only if no block
/// overlaps it and `occupied + requested <= capacity`.
pub(crate) fn check_capacity(
    index: &OccupancyIndex,
    span: &Span,
    requested: u32,
    capacity: u32,
) -> Result<(), EngineError> {
    let remaining = index.remaining(span, capacity);
    if requested > remaining {
        return Err(EngineError::CapacityExceeded { remaining });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;

    fn appt(start: Ms, end: Ms, spots: u32) -> OccupancySpan {
        OccupancySpan {
            span: Span::new(start, end),
            kind: OccupancyKind::Appointment { spots },
        }
    }

    fn block(start: Ms, end: Ms) -> OccupancySpan {
        OccupancySpan {
            span: Span::new(start, end),
            kind: OccupancyKind::Block,
        }
    }

    #[test]
    fn sums_spots_of_overlapping_appointments() {
        let idx = OccupancyIndex::new(vec![appt(0, 30 * M, 2), appt(15 * M, 45 * M, 1)]);
        assert_eq!(idx.occupied_units(&Span::new(20 * M, 25 * M), 5), 3);
        assert_eq!(idx.occupied_units(&Span::new(35 * M, 40 * M), 5), 1);
        assert_eq!(idx.occupied_units(&Span::new(45 * M, 60 * M), 5), 0);
    }

    #[test]
    fn touching_boundary_is_not_occupied() {
        let idx = OccupancyIndex::new(vec![appt(9 * 60 * M, 10 * 60 * M, 1)]);
        let next = Span::new(10 * 60 * M, 11 * 60 * M);
        assert_eq!(idx.occupied_units(&next, 1), 0);
        assert!(check_capacity(&idx, &next, 1, 1).is_ok());
    }

    #[test]
    fn block_saturates_any_capacity() {
        let idx = OccupancyIndex::new(vec![block(12 * 60 * M, 13 * 60 * M)]);
        let q = Span::new(12 * 60 * M + 45 * M, 13 * 60 * M + 45 * M);
        assert!(idx.occupied_units(&q, 6) >= 6);
        assert!(idx.is_blocked(&q));
        assert_eq!(idx.remaining(&q, 6), 0);
        assert!(matches!(
            check_capacity(&idx, &q, 1, 6),
            Err(EngineError::CapacityExceeded { remaining: 0 })
        ));
    }

    #[test]
    fn remaining_reports_free_units() {
        let idx = OccupancyIndex::new(vec![appt(0, 60 * M, 1)]);
        let q = Span::new(0, 30 * M);
        assert_eq!(idx.remaining(&q, 2), 1);
        assert!(check_capacity(&idx, &q, 1, 2).is_ok());
        assert!(matches!(
            check_capacity(&idx, &q, 2, 2),
            Err(EngineError::CapacityExceeded { remaining: 1 })
        ));
    }

    #[test]
    fn peak_counts_simultaneous_spots_only() {
        // Two back-to-back appointments each overlap the long one but never
        // each other: the peak is 2, not 3.
        let idx = OccupancyIndex::new(vec![
            appt(0, 60 * M, 1),
            appt(0, 30 * M, 1),
            appt(30 * M, 60 * M, 1),
            block(0, 60 * M),
        ]);
        assert_eq!(idx.peak_units(0), 2);
        assert_eq!(idx.peak_units(60 * M), 0);
    }

    #[test]
    fn peak_ignores_appointments_already_over() {
        let idx = OccupancyIndex::new(vec![appt(0, 30 * M, 3), appt(20 * M, 90 * M, 1)]);
        assert_eq!(idx.peak_units(0), 4);
        assert_eq!(idx.peak_units(30 * M), 1);
    }

    #[test]
    fn collect_skips_cancelled_and_out_of_window() {
        let mut ledger = ServiceLedger::new(Service {
            id: Ulid::new(),
            name: "Aula".into(),
            duration_minutes: 60,
            capacity: 4,
            price_cents: None,
            requires_payment: false,
            active: true,
        });
        let service_id = ledger.service.id;
        let mk = |start: Ms, status| Appointment {
            id: Ulid::new(),
            service_id,
            client_id: None,
            client_name: "Bia".into(),
            client_phone: None,
            span: Span::new(start, start + 60 * M),
            status,
            spots: 1,
            source: BookingSource::Online,
            notes: None,
            created_at: 0,
        };
        let a = mk(0, AppointmentStatus::Confirmed);
        let b = mk(0, AppointmentStatus::Cancelled);
        let c = mk(10 * 60 * M, AppointmentStatus::Scheduled);
        ledger.insert_appointment(a);
        ledger.insert_appointment(b);
        ledger.insert_appointment(c);

        let mut blocks = BlockSet::default();
        blocks.insert(TimeBlock {
            id: Ulid::new(),
            title: "Almoço".into(),
            span: Span::new(30 * M, 90 * M),
        });

        let idx = OccupancyIndex::collect(&ledger, &blocks, &Span::new(0, 2 * 60 * M));
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.occupied_units(&Span::new(0, 15 * M), 4), 1);
    }

    #[test]
    fn validate_span_bounds() {
        assert!(validate_span(&Span::new(0, 1000)).is_err());
        let inverted = Span {
            start: MIN_VALID_TIMESTAMP_MS + 10,
            end: MIN_VALID_TIMESTAMP_MS,
        };
        assert!(validate_span(&inverted).is_err());
        assert!(validate_span(&Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + 1)).is_ok());
    }
}
