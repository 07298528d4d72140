pub mod cycles;
pub mod queue;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const DEFAULT_MIN_CYCLE_INTERVAL_MINS: u32 = 120;
pub const DEFAULT_MAX_EXECUTION_TIME_MINS: u32 = 60;

/// Allowed range for the minimum spacing between two executions of the same
/// cycle, minutes.
pub const MIN_CYCLE_INTERVAL_RANGE: (u32, u32) = (60, 240);
/// Allowed range for a single run's execution budget, minutes.
pub const MAX_EXECUTION_TIME_RANGE: (u32, u32) = (1, 1440);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Loaded,
    Scheduled,
    Running,
    Paused,
    Stopped,
    Error,
    Completed,
}

/// Program template as authored by the user: a set of daily cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub cycles: Vec<CycleTemplate>,
    #[serde(default)]
    pub min_cycle_interval_mins: Option<u32>,
    #[serde(default)]
    pub max_execution_time_mins: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleTemplate {
    /// Time of day in HH:MM, 24h clock.
    pub start_time: String,
    pub flow_id: String,
    #[serde(default)]
    pub duration_mins: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCycle {
    pub cycle_id: String,
    pub start_time: String,
    pub flow_id: String,
    #[serde(default)]
    pub duration_mins: Option<u32>,
    pub last_executed: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
    pub execution_count: u64,
    pub is_active: bool,
    pub is_currently_executing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedCycle {
    pub cycle_id: String,
    pub skip_until: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The single live program instance. At most one exists system-wide; the
/// scheduler owns it and every mutation goes through scheduler operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveProgram {
    pub program_id: String,
    pub controller_id: String,
    pub name: String,
    pub status: ProgramStatus,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub scheduled_start_date: Option<DateTime<Utc>>,
    pub delay_days: Option<u32>,
    pub min_cycle_interval_mins: u32,
    pub max_execution_time_mins: u32,
    pub active_cycles: Vec<ActiveCycle>,
    pub skipped_cycles: Vec<SkippedCycle>,
    pub total_executions: u64,
    pub last_error: Option<String>,
}

impl ActiveProgram {
    /// Instantiate a program template. Cycle ids are positional and stable
    /// for the lifetime of the active program.
    pub fn from_program(
        program: &Program,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        if program.cycles.is_empty() {
            return Err(EngineError::Program(format!(
                "program '{}' has no cycles",
                program.name
            )));
        }

        let mut active_cycles = Vec::with_capacity(program.cycles.len());
        for (index, cycle) in program.cycles.iter().enumerate() {
            active_cycles.push(ActiveCycle {
                cycle_id: format!("cycle-{index}"),
                start_time: cycle.start_time.clone(),
                flow_id: cycle.flow_id.clone(),
                duration_mins: cycle.duration_mins,
                last_executed: None,
                next_execution: cycles::next_occurrence(&cycle.start_time, now)?,
                execution_count: 0,
                is_active: cycle.is_active,
                is_currently_executing: false,
            });
        }

        let (lo, hi) = MIN_CYCLE_INTERVAL_RANGE;
        let min_interval = program
            .min_cycle_interval_mins
            .unwrap_or(DEFAULT_MIN_CYCLE_INTERVAL_MINS)
            .clamp(lo, hi);
        let (lo, hi) = MAX_EXECUTION_TIME_RANGE;
        let max_execution = program
            .max_execution_time_mins
            .unwrap_or(DEFAULT_MAX_EXECUTION_TIME_MINS)
            .clamp(lo, hi);

        Ok(Self {
            program_id: program.id.clone(),
            controller_id: controller_id.to_string(),
            name: program.name.clone(),
            status: ProgramStatus::Loaded,
            started_at: now,
            paused_at: None,
            stopped_at: None,
            scheduled_start_date: None,
            delay_days: None,
            min_cycle_interval_mins: min_interval,
            max_execution_time_mins: max_execution,
            active_cycles,
            skipped_cycles: Vec::new(),
            total_executions: 0,
            last_error: None,
        })
    }

    pub fn cycle(&self, cycle_id: &str) -> Option<&ActiveCycle> {
        self.active_cycles.iter().find(|c| c.cycle_id == cycle_id)
    }

    pub fn cycle_mut(&mut self, cycle_id: &str) -> Option<&mut ActiveCycle> {
        self.active_cycles.iter_mut().find(|c| c.cycle_id == cycle_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template() -> Program {
        Program {
            id: "prog-1".into(),
            name: "Lettuce week 3".into(),
            cycles: vec![
                CycleTemplate {
                    start_time: "08:00".into(),
                    flow_id: "flow-a".into(),
                    duration_mins: Some(30),
                    is_active: true,
                },
                CycleTemplate {
                    start_time: "20:00".into(),
                    flow_id: "flow-b".into(),
                    duration_mins: None,
                    is_active: false,
                },
            ],
            min_cycle_interval_mins: None,
            max_execution_time_mins: Some(5000),
        }
    }

    #[test]
    fn from_program_assigns_positional_cycle_ids() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let active = ActiveProgram::from_program(&template(), "ctl-1", now).unwrap();
        assert_eq!(active.active_cycles[0].cycle_id, "cycle-0");
        assert_eq!(active.active_cycles[1].cycle_id, "cycle-1");
        assert_eq!(active.status, ProgramStatus::Loaded);
        assert!(!active.active_cycles[1].is_active);
    }

    #[test]
    fn intervals_clamp_to_their_ranges() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let active = ActiveProgram::from_program(&template(), "ctl-1", now).unwrap();
        assert_eq!(active.min_cycle_interval_mins, 120);
        // 5000 minutes clamps to the 24h ceiling.
        assert_eq!(active.max_execution_time_mins, 1440);
    }

    #[test]
    fn empty_program_is_rejected() {
        let now = Utc::now();
        let program = Program {
            id: "p".into(),
            name: "empty".into(),
            cycles: vec![],
            min_cycle_interval_mins: None,
            max_execution_time_mins: None,
        };
        assert!(ActiveProgram::from_program(&program, "ctl", now).is_err());
    }

    #[test]
    fn active_program_round_trips_through_json() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let active = ActiveProgram::from_program(&template(), "ctl-1", now).unwrap();
        let json = serde_json::to_string(&active).unwrap();
        let parsed: ActiveProgram = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.program_id, "prog-1");
        assert_eq!(parsed.active_cycles.len(), 2);
        assert_eq!(parsed.status, ProgramStatus::Loaded);
    }
}
