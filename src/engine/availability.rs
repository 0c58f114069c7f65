use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time;

use super::{Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Slot-sized candidates tiling `window` from its start that no busy span touches.
///
/// A candidate is emitted only if it fits entirely before `window.end`.
/// Busy spans may arrive in any order; they are sorted and swept with one
/// forward cursor, since candidate starts only increase.
pub fn free_slots(window: Span, slot_ms: Ms, busy: &[Span]) -> Vec<Span> {
    if slot_ms <= 0 {
        return Vec::new();
    }
    let mut busy = busy.to_vec();
    busy.sort_by_key(|s| s.start);

    let mut free = Vec::new();
    let mut cursor = 0;
    let mut start = window.start;
    while start + slot_ms <= window.end {
        let candidate = Span::new(start, start + slot_ms);

        // Nothing ending at or before this candidate can touch a later one.
        while cursor < busy.len() && busy[cursor].end <= candidate.start {
            cursor += 1;
        }
        let taken = busy[cursor..]
            .iter()
            .take_while(|b| b.start < candidate.end)
            .any(|b| b.overlaps(&candidate));
        if !taken {
            free.push(candidate);
        }
        start += slot_ms;
    }
    free
}

impl Engine {
    /// Free slots of one doctor on `date`, within working hours.
    pub async fn availability_spans(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let doctor = self
            .doctors
            .get_doctor(doctor_id)
            .await?
            .ok_or(EngineError::NotFound(doctor_id))?;
        let window = time::day_window(date, self.hours.start, self.hours.end);
        let busy: Vec<Span> = self
            .reservations
            .find_overlapping(doctor_id, AppointmentStatus::Confirmed, window)
            .await?
            .into_iter()
            .map(|a| a.span)
            .collect();
        Ok(free_slots(window, doctor.slot_ms(), &busy))
    }

    /// Start times of the free slots, formatted as ISO local date-times.
    pub async fn availability(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self
            .availability_spans(doctor_id, date)
            .await?
            .into_iter()
            .map(|s| time::format_ms(s.start))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;
    const H: Ms = 60 * M;

    fn starts(slots: &[Span]) -> Vec<Ms> {
        slots.iter().map(|s| s.start).collect()
    }

    #[test]
    fn empty_day_is_fully_free() {
        let free = free_slots(Span::new(9 * H, 12 * H), 30 * M, &[]);
        assert_eq!(
            starts(&free),
            vec![9 * H, 9 * H + 30 * M, 10 * H, 10 * H + 30 * M, 11 * H, 11 * H + 30 * M]
        );
        assert!(free.iter().all(|s| s.duration_ms() == 30 * M));
    }

    #[test]
    fn booked_slots_are_skipped() {
        let busy = [
            Span::new(11 * H, 11 * H + 30 * M),
            Span::new(10 * H, 10 * H + 30 * M),
        ];
        let free = free_slots(Span::new(9 * H, 12 * H), 30 * M, &busy);
        assert_eq!(
            starts(&free),
            vec![9 * H, 9 * H + 30 * M, 10 * H + 30 * M, 11 * H + 30 * M]
        );
    }

    #[test]
    fn trailing_partial_slot_dropped() {
        // 45-minute slots in 2 hours: 9:00, 9:45; 10:30 would end at 11:15.
        let free = free_slots(Span::new(9 * H, 11 * H), 45 * M, &[]);
        assert_eq!(starts(&free), vec![9 * H, 9 * H + 45 * M]);
    }

    #[test]
    fn misaligned_booking_blocks_both_neighbours() {
        let busy = [Span::new(9 * H + 15 * M, 9 * H + 45 * M)];
        let free = free_slots(Span::new(9 * H, 11 * H), 30 * M, &busy);
        assert_eq!(starts(&free), vec![10 * H, 10 * H + 30 * M]);
    }

    #[test]
    fn touching_booking_does_not_block() {
        let busy = [Span::new(8 * H, 9 * H), Span::new(10 * H, 11 * H)];
        let free = free_slots(Span::new(9 * H, 10 * H), 30 * M, &busy);
        assert_eq!(starts(&free), vec![9 * H, 9 * H + 30 * M]);
    }

    #[test]
    fn long_booking_outlasting_short_one() {
        // Sorted by start, the long span comes first but ends last.
        let busy = [Span::new(9 * H, 11 * H), Span::new(9 * H + 30 * M, 9 * H + 45 * M)];
        let free = free_slots(Span::new(9 * H, 12 * H), 30 * M, &busy);
        assert_eq!(starts(&free), vec![11 * H, 11 * H + 30 * M]);
    }

    #[test]
    fn slot_longer_than_window() {
        assert!(free_slots(Span::new(9 * H, 10 * H), 90 * M, &[]).is_empty());
    }

    #[test]
    fn deterministic_for_fixed_input() {
        let busy = [Span::new(10 * H, 10 * H + 20 * M), Span::new(13 * H, 14 * H)];
        let window = Span::new(9 * H, 17 * H);
        assert_eq!(free_slots(window, 20 * M, &busy), free_slots(window, 20 * M, &busy));
    }
}
