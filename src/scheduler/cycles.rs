//! Time-of-day math for daily cycles: next-occurrence computation, skip
//! windows, and the auto-pause rule for retroactive start-time changes.

use chrono::{DateTime, Timelike, Utc};
use croner::Cron;

use super::{ActiveCycle, ActiveProgram};
use crate::error::EngineError;

/// Parse an HH:MM, 24h start time.
pub fn parse_start_time(value: &str) -> Result<(u32, u32), EngineError> {
    let invalid = || EngineError::InvalidTime(value.to_string());
    let (hours, minutes) = value.split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok((hours, minutes))
}

/// Next daily occurrence of an HH:MM start time strictly after `now`:
/// today if the time has not passed yet, tomorrow otherwise.
pub fn next_occurrence(start_time: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    let (hours, minutes) = parse_start_time(start_time)?;
    let cron = Cron::new(&format!("{minutes} {hours} * * *"))
        .parse()
        .map_err(|e| EngineError::Program(format!("bad cycle schedule: {e}")))?;
    cron.find_next_occurrence(&now, false)
        .map_err(|e| EngineError::Program(format!("no next occurrence: {e}")))
}

/// A cycle is skipped while a live skip entry covers it. Expired entries are
/// pruned lazily by [`prune_expired_skips`].
pub fn is_cycle_skipped(program: &ActiveProgram, cycle_id: &str, now: DateTime<Utc>) -> bool {
    program
        .skipped_cycles
        .iter()
        .any(|skip| skip.cycle_id == cycle_id && skip.skip_until > now)
}

pub fn prune_expired_skips(program: &mut ActiveProgram, now: DateTime<Utc>) -> usize {
    let before = program.skipped_cycles.len();
    program.skipped_cycles.retain(|skip| skip.skip_until > now);
    before - program.skipped_cycles.len()
}

/// Add a skip window, replacing any previous entry for the same cycle.
pub fn add_skip(
    program: &mut ActiveProgram,
    cycle_id: &str,
    skip_until: DateTime<Utc>,
    reason: Option<String>,
) {
    program.skipped_cycles.retain(|skip| skip.cycle_id != cycle_id);
    program.skipped_cycles.push(super::SkippedCycle {
        cycle_id: cycle_id.to_string(),
        skip_until,
        reason,
    });
}

pub fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_hour(23)
        .and_then(|t| t.with_minute(59))
        .and_then(|t| t.with_second(59))
        .unwrap_or(now)
}

/// Auto-pause rule: changing a cycle's start time to later in the day, on a
/// day it already executed, must not produce a second same-day execution.
/// Deliberately compares wall-clock minutes only, so schedules crossing
/// midnight keep the historical behavior.
pub fn should_auto_pause(
    cycle: &ActiveCycle,
    new_start_time: &str,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let (new_hours, new_minutes) = parse_start_time(new_start_time)?;
    let executed_today = cycle
        .last_executed
        .is_some_and(|last| last.date_naive() == now.date_naive());
    let new_total = new_hours * 60 + new_minutes;
    let now_total = now.hour() * 60 + now.minute();
    Ok(executed_today && new_total > now_total)
}

/// Whether a cycle should be dispatched on this tick.
pub fn is_due(program: &ActiveProgram, cycle: &ActiveCycle, now: DateTime<Utc>) -> bool {
    if !cycle.is_active || cycle.is_currently_executing {
        return false;
    }
    if is_cycle_skipped(program, &cycle.cycle_id, now) {
        return false;
    }
    if let Some(last) = cycle.last_executed {
        let since = now.signed_duration_since(last);
        if since.num_minutes() < i64::from(program.min_cycle_interval_mins) {
            return false;
        }
    }
    cycle.next_execution <= now
}
