use std::collections::HashSet;
use std::time::Instant;

use chrono_tz::Tz;
use ulid::Ulid;

use crate::calendar;
use crate::limits::SLOT_STEP_MINUTES;
use crate::model::*;
use crate::observability;

use super::occupancy::OccupancyIndex;
use super::{Engine, EngineError};

// ── Slot computation ─────────────────────────────────────────────

/// Bookable slots among `grid` candidates.
///
/// A candidate is kept when it starts strictly after `now`, no time block
/// overlaps `[start, start + duration)`, and fewer than `capacity` units are
/// occupied over that span. Labels are deduplicated: when two instants share a
/// wall-clock label (the repeated hour of a fall-back night) the earlier wins.
pub fn compute_slots(
    grid: &[Ms],
    index: &OccupancyIndex,
    duration: Ms,
    capacity: u32,
    now: Ms,
    tz: Tz,
) -> Result<Vec<Slot>, EngineError> {
    let mut seen = HashSet::new();
    let mut slots = Vec::new();
    for &start in grid {
        if start <= now {
            continue;
        }
        let span = Span::new(start, start + duration);
        let spots_left = index.remaining(&span, capacity);
        if spots_left == 0 {
            continue;
        }
        let time = calendar::time_label(start, tz)?;
        if !seen.insert(time.clone()) {
            continue;
        }
        slots.push(Slot {
            time,
            start,
            spots_left,
        });
    }
    Ok(slots)
}

impl Engine {
    /// Start times on `date` (business-local `YYYY-MM-DD`) at which one more
    /// unit of `service_id` could be booked right now.
    ///
    /// Read-only. An unknown or inactive service is `NotFound` on any day; for
    /// a known one, a closed or unconfigured day yields an empty list.
    pub async fn availability(&self, service_id: Ulid, date: &str) -> Result<Vec<Slot>, EngineError> {
        let started = Instant::now();
        let date = calendar::parse_date(date)?;
        let (_, tz) = self.business_tz().await?;

        let (day_start, day_end) = calendar::day_window(date, tz)?;
        let (service, index) = self
            .read_snapshot(&service_id, &Span::new(day_start, day_end))
            .await?;
        if !service.active {
            return Err(EngineError::not_found("service", service_id));
        }

        let Some(hours) = self
            .hours_for(calendar::day_of_week(date))
            .await
            .filter(|h| h.active && h.start < h.end)
        else {
            return Ok(Vec::new());
        };

        let window_start = calendar::to_instant_or_after(date, hours.start, tz)?;
        let window_end = calendar::to_instant_or_after(date, hours.end, tz)?;
        if window_end <= window_start {
            return Ok(Vec::new());
        }
        let grid = calendar::slot_grid(
            window_start,
            window_end,
            SLOT_STEP_MINUTES,
            service.duration_ms(),
        )?;

        let slots = compute_slots(
            &grid,
            &index,
            service.duration_ms(),
            service.capacity,
            self.now_ms(),
            tz,
        )?;

        metrics::histogram!(observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            "availability {service_id} {date}: {} of {} candidate(s) open",
            slots.len(),
            grid.len()
        );
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::occupancy::{OccupancyKind, OccupancySpan};

    const M: Ms = MINUTE_MS;

    fn utc() -> Tz {
        chrono_tz::UTC
    }

    fn booked(start: Ms, end: Ms, spots: u32) -> OccupancySpan {
        OccupancySpan {
            span: Span::new(start, end),
            kind: OccupancyKind::Appointment { spots },
        }
    }

    fn labels(slots: &[Slot]) -> Vec<&str> {
        slots.iter().map(|s| s.time.as_str()).collect()
    }

    #[test]
    fn empty_index_lists_whole_grid() {
        let grid = calendar::slot_grid(9 * 60 * M, 10 * 60 * M, 15, 30 * M).unwrap();
        let slots = compute_slots(&grid, &OccupancyIndex::default(), 30 * M, 1, 0, utc()).unwrap();
        assert_eq!(labels(&slots), vec!["09:00", "09:15", "09:30"]);
        assert!(slots.iter().all(|s| s.spots_left == 1));
    }

    #[test]
    fn partial_capacity_reports_spots_left() {
        let grid = vec![9 * 60 * M, 9 * 60 * M + 30 * M];
        let index = OccupancyIndex::new(vec![booked(9 * 60 * M, 9 * 60 * M + 30 * M, 1)]);
        let slots = compute_slots(&grid, &index, 30 * M, 2, 0, utc()).unwrap();
        assert_eq!(slots[0].spots_left, 1);
        assert_eq!(slots[1].spots_left, 2);
    }

    #[test]
    fn full_and_past_candidates_are_dropped() {
        let grid = vec![8 * 60 * M, 9 * 60 * M, 10 * 60 * M];
        let index = OccupancyIndex::new(vec![booked(9 * 60 * M, 10 * 60 * M, 1)]);
        let slots = compute_slots(&grid, &index, 60 * M, 1, 8 * 60 * M, utc()).unwrap();
        assert_eq!(labels(&slots), vec!["10:00"]);
    }

    #[test]
    fn candidate_equal_to_now_is_past() {
        let grid = vec![14 * 60 * M + 30 * M, 14 * 60 * M + 45 * M];
        let now = 14 * 60 * M + 30 * M;
        let slots = compute_slots(&grid, &OccupancyIndex::default(), 15 * M, 1, now, utc()).unwrap();
        assert_eq!(labels(&slots), vec!["14:45"]);
    }
}
