//! The cycle scheduler. Owns the single [`ActiveProgram`], ticks once a
//! minute, dispatches due cycles to the interpreter, parks competing
//! triggers in the queue, and enforces the per-run execution budget.
//!
//! One cycle's failure never halts its siblings and never kills the tick
//! loop: every run-level error lands in `last_error` and the program keeps
//! going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cycles;
use super::queue::{MonitoringQueue, QueueItem};
use super::{ActiveProgram, ProgramStatus};
use crate::error::EngineError;
use crate::flows::Flow;
use crate::flows::interpreter::{FlowInterpreter, RunOutcome, RunState};
use crate::store::Store;

/// Owner marker for queue entries that no program claimed.
const MANUAL_OWNER: &str = "manual";

#[derive(Debug, Clone)]
enum RunOrigin {
    Cycle { cycle_id: String },
    Queued,
}

struct ActiveRun {
    origin: RunOrigin,
    flow_id: String,
    started_at: DateTime<Utc>,
    timed_out: bool,
    handle: JoinHandle<RunOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub has_active_program: bool,
    pub program_status: Option<ProgramStatus>,
    pub program_name: Option<String>,
    pub time_to_scheduled_start_secs: Option<i64>,
    pub next_execution: Option<DateTime<Utc>>,
    pub interpreter_state: RunState,
    pub queue_pending: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    interpreter: Arc<FlowInterpreter>,
    program: Mutex<Option<ActiveProgram>>,
    queue: Mutex<MonitoringQueue>,
    active_run: Mutex<Option<ActiveRun>>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        interpreter: Arc<FlowInterpreter>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            interpreter,
            program: Mutex::new(None),
            queue: Mutex::new(MonitoringQueue::new()),
            active_run: Mutex::new(None),
            tick_interval,
        }
    }

    /// Restore persisted state after a restart. Pending queue entries left
    /// over from the previous run drain once the device layer is free.
    pub async fn restore(&self) {
        if let Some(program) = self.store.load_active_program().await {
            tracing::info!(program = %program.name, status = ?program.status, "restored active program");
            *self.program.lock().await = Some(program);
        }
        let items = self.store.load_queue().await;
        if !items.is_empty() {
            tracing::info!(items = items.len(), "restored execution queue");
            *self.queue.lock().await = MonitoringQueue::from_items(items);
        }
    }

    pub async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.tick_interval, "scheduler loop started");
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    /// One scheduler pass. Takes `now` as a parameter so time-sensitive
    /// behavior is testable.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.reap_finished_run().await;
        self.promote_scheduled(now).await;
        self.enforce_execution_budget(now).await;
        self.dispatch_due_cycles(now).await;
        self.drain_queue(now).await;
        self.persist().await;
    }

    // ── Program control ─────────────────────────────────────────────

    pub async fn load_program(
        &self,
        program_id: &str,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !matches!(
                existing.status,
                ProgramStatus::Stopped | ProgramStatus::Completed
            ) {
                return Err(EngineError::Program(
                    "another program is already active, stop it first".to_string(),
                ));
            }
        }

        let template = self
            .store
            .get_program(program_id)
            .await
            .ok_or_else(|| EngineError::Program(format!("program '{program_id}' not found")))?;
        let active = ActiveProgram::from_program(&template, controller_id, now)?;

        if let Err(e) = self.store.clear_active_program().await {
            tracing::warn!(error = %e, "failed to clear previous active program");
        }
        if let Err(e) = self.store.save_active_program(&active).await {
            tracing::warn!(error = %e, "failed to persist active program");
        }
        tracing::info!(program = %active.name, cycles = active.active_cycles.len(), "program loaded");
        *guard = Some(active);
        drop(guard);

        // Queue entries owned by a replaced program are orphans now.
        let removed = self
            .queue
            .lock()
            .await
            .cleanup(|owner| owner == program_id || owner == MANUAL_OWNER);
        if removed > 0 {
            tracing::info!(removed, "pruned queue entries from previous program");
        }
        Ok(())
    }

    /// Load a program (unless it is already the loaded one) and start it.
    pub async fn start(
        &self,
        program_id: &str,
        controller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let already_loaded = self
            .program
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| p.program_id == program_id);
        if !already_loaded {
            self.load_program(program_id, controller_id, now).await?;
        }
        self.start_program(now).await
    }

    /// Delay the start by whole days; the tick promotes the program to
    /// `running` once the date arrives.
    pub async fn schedule_program(
        &self,
        delay_days: u32,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if delay_days > 365 {
            return Err(EngineError::Program(
                "delay must be between 0 and 365 days".to_string(),
            ));
        }
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        program.status = ProgramStatus::Scheduled;
        program.delay_days = Some(delay_days);
        program.scheduled_start_date = Some(now + chrono::Duration::days(i64::from(delay_days)));
        tracing::info!(program = %program.name, delay_days, "program scheduled");
        Ok(())
    }

    pub async fn start_program(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        if program.status == ProgramStatus::Running {
            return Err(EngineError::Program("program is already running".to_string()));
        }
        program.status = ProgramStatus::Running;
        program.started_at = now;
        program.paused_at = None;
        program.stopped_at = None;
        tracing::info!(program = %program.name, "▶ program started");
        Ok(())
    }

    /// Freeze the program and any in-flight run. Cooperative: the
    /// interpreter parks at the next block boundary.
    pub async fn pause(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        if program.status != ProgramStatus::Running {
            return Err(EngineError::Program("program is not running".to_string()));
        }
        program.status = ProgramStatus::Paused;
        program.paused_at = Some(now);
        drop(guard);
        self.interpreter.pause();
        tracing::info!("⏸ program paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        if program.status != ProgramStatus::Paused {
            return Err(EngineError::Program("program is not paused".to_string()));
        }
        program.status = ProgramStatus::Running;
        program.paused_at = None;
        drop(guard);
        self.interpreter.resume();
        tracing::info!("▶ program resumed");
        Ok(())
    }

    /// Terminate any in-flight run and release the device-layer claim. The
    /// queue keeps its entries and drains on the next free tick.
    pub async fn stop_program(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        program.status = ProgramStatus::Stopped;
        program.stopped_at = Some(now);
        program.paused_at = None;
        for cycle in &mut program.active_cycles {
            cycle.is_currently_executing = false;
        }
        drop(guard);
        self.interpreter.stop();
        tracing::info!("■ program stopped");
        Ok(())
    }

    pub async fn remove_program(&self) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        match guard.as_ref() {
            None => return Err(EngineError::Program("no active program".to_string())),
            Some(p) if p.status == ProgramStatus::Running => {
                return Err(EngineError::Program(
                    "cannot remove a running program, stop it first".to_string(),
                ));
            }
            Some(_) => {}
        }
        *guard = None;
        drop(guard);
        if let Err(e) = self.store.clear_active_program().await {
            tracing::warn!(error = %e, "failed to clear active program");
        }
        let removed = self.queue.lock().await.cleanup(|owner| owner == MANUAL_OWNER);
        if removed > 0 {
            tracing::info!(removed, "pruned queue entries of removed program");
        }
        Ok(())
    }

    // ── Cycle control ───────────────────────────────────────────────

    pub async fn skip_cycle(
        &self,
        cycle_id: &str,
        days: u32,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if days > 365 {
            return Err(EngineError::Program(
                "skip must be between 0 and 365 days".to_string(),
            ));
        }
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        if program.cycle(cycle_id).is_none() {
            return Err(EngineError::Program(format!("cycle '{cycle_id}' not found")));
        }
        let skip_until = now + chrono::Duration::days(i64::from(days));
        cycles::add_skip(program, cycle_id, skip_until, reason);
        tracing::info!(cycle = %cycle_id, until = %skip_until, "cycle skipped");
        Ok(())
    }

    pub async fn remove_skip(&self, cycle_id: &str) -> Result<(), EngineError> {
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        program.skipped_cycles.retain(|s| s.cycle_id != cycle_id);
        Ok(())
    }

    /// Change a cycle's HH:MM start time. If the cycle already ran today and
    /// the new time lies later than the current time, the remainder of the
    /// day is skipped so the cycle cannot fire twice on the same day.
    pub async fn update_cycle_start_time(
        &self,
        cycle_id: &str,
        new_start_time: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        cycles::parse_start_time(new_start_time)?;
        let mut guard = self.program.lock().await;
        let program = guard
            .as_mut()
            .ok_or_else(|| EngineError::Program("no active program".to_string()))?;
        let cycle = program
            .cycle(cycle_id)
            .ok_or_else(|| EngineError::Program(format!("cycle '{cycle_id}' not found")))?;

        let auto_pause = cycles::should_auto_pause(cycle, new_start_time, now)?;
        if auto_pause {
            let until = cycles::end_of_day(now);
            cycles::add_skip(
                program,
                cycle_id,
                until,
                Some(format!(
                    "auto-paused: start time moved to {new_start_time} after today's execution"
                )),
            );
            tracing::info!(cycle = %cycle_id, until = %until, "auto-paused for the rest of the day");
        }

        let cycle = program
            .cycle_mut(cycle_id)
            .ok_or_else(|| EngineError::Program(format!("cycle '{cycle_id}' not found")))?;
        cycle.start_time = new_start_time.to_string();
        cycle.next_execution = cycles::next_occurrence(new_start_time, now)?;
        tracing::info!(cycle = %cycle_id, start_time = %new_start_time, next = %cycle.next_execution, "cycle start time updated");
        Ok(())
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Park a flow for execution. A duplicate pending entry is logged and
    /// ignored; the caller never sees it fail for that reason.
    pub async fn enqueue_flow(
        &self,
        flow_id: &str,
        priority: u8,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let flow_name = self
            .store
            .get_flow(flow_id)
            .await
            .map(|f| f.name)
            .unwrap_or_else(|| flow_id.to_string());
        let owner = self
            .program
            .lock()
            .await
            .as_ref()
            .map(|p| p.program_id.clone())
            .unwrap_or_else(|| MANUAL_OWNER.to_string());

        match self
            .queue
            .lock()
            .await
            .enqueue(flow_id, &flow_name, &owner, priority, now)
        {
            Ok(()) => {
                tracing::info!(flow = %flow_id, priority, "flow enqueued");
            }
            Err(e) => {
                tracing::warn!(flow = %flow_id, error = %e, "enqueue ignored");
            }
        }
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub async fn active_program(&self) -> Option<ActiveProgram> {
        self.program.lock().await.clone()
    }

    pub async fn queue_items(&self) -> Vec<QueueItem> {
        self.queue.lock().await.items().to_vec()
    }

    pub async fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let guard = self.program.lock().await;
        let program = guard.as_ref();
        let time_to_start = program
            .filter(|p| p.status == ProgramStatus::Scheduled)
            .and_then(|p| p.scheduled_start_date)
            .map(|date| (date - now).num_seconds().max(0));
        let next_execution = program
            .map(|p| {
                p.active_cycles
                    .iter()
                    .filter(|c| c.is_active)
                    .map(|c| c.next_execution)
                    .min()
            })
            .unwrap_or(None);
        SchedulerStatus {
            has_active_program: program.is_some(),
            program_status: program.map(|p| p.status),
            program_name: program.map(|p| p.name.clone()),
            time_to_scheduled_start_secs: time_to_start,
            next_execution,
            interpreter_state: self.interpreter.state(),
            queue_pending: self.queue.lock().await.pending_len(),
        }
    }

    // ── Tick phases ─────────────────────────────────────────────────

    async fn reap_finished_run(&self) {
        let finished = {
            let mut active = self.active_run.lock().await;
            match active.as_ref() {
                Some(run) if run.handle.is_finished() => active.take(),
                _ => None,
            }
        };
        let Some(run) = finished else { return };

        let outcome = match run.handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                RunOutcome::Failed(EngineError::Program(format!("run task died: {join_err}")))
            }
        };

        match run.origin {
            RunOrigin::Cycle { cycle_id } => {
                let mut guard = self.program.lock().await;
                let Some(program) = guard.as_mut() else { return };
                let mut completed = false;
                let mut failure = None;
                if let Some(cycle) = program.cycle_mut(&cycle_id) {
                    cycle.is_currently_executing = false;
                    match &outcome {
                        RunOutcome::Completed(_) => {
                            cycle.execution_count += 1;
                            completed = true;
                            tracing::info!(cycle = %cycle_id, "✓ cycle run completed");
                        }
                        RunOutcome::Stopped => {
                            tracing::info!(cycle = %cycle_id, "cycle run stopped");
                        }
                        RunOutcome::Failed(e) => {
                            failure = Some(e.to_string());
                            tracing::error!(cycle = %cycle_id, error = %e, "✗ cycle run failed");
                        }
                    }
                }
                if completed {
                    program.total_executions += 1;
                }
                if failure.is_some() {
                    program.last_error = failure;
                }
            }
            RunOrigin::Queued => {
                let mut queue = self.queue.lock().await;
                match &outcome {
                    RunOutcome::Completed(_) => {
                        queue.mark_completed(&run.flow_id);
                        tracing::info!(flow = %run.flow_id, "✓ queued flow completed");
                    }
                    RunOutcome::Stopped => {
                        queue.mark_failed(&run.flow_id, "stopped before completion");
                        tracing::info!(flow = %run.flow_id, "queued flow stopped");
                    }
                    RunOutcome::Failed(e) => {
                        queue.mark_failed(&run.flow_id, &e.to_string());
                        tracing::error!(flow = %run.flow_id, error = %e, "✗ queued flow failed");
                    }
                }
            }
        }
    }

    async fn promote_scheduled(&self, now: DateTime<Utc>) {
        let mut guard = self.program.lock().await;
        let Some(program) = guard.as_mut() else { return };
        cycles::prune_expired_skips(program, now);
        if program.status == ProgramStatus::Scheduled
            && program.scheduled_start_date.is_some_and(|date| date <= now)
        {
            program.status = ProgramStatus::Running;
            program.started_at = now;
            tracing::info!(program = %program.name, "scheduled start date reached, program running");
        }
    }

    /// Force-stop a run that exceeded the program's execution budget. The
    /// occurrence is recorded as failed; the cycle reschedules normally.
    async fn enforce_execution_budget(&self, now: DateTime<Utc>) {
        let budget_mins = {
            let guard = self.program.lock().await;
            match guard.as_ref() {
                Some(p) => p.max_execution_time_mins,
                None => return,
            }
        };

        let overrun = {
            let mut active = self.active_run.lock().await;
            match active.as_mut() {
                Some(run) if !run.timed_out => {
                    let elapsed = now.signed_duration_since(run.started_at);
                    if elapsed.num_minutes() >= i64::from(budget_mins) {
                        run.timed_out = true;
                        Some(run.origin.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        let Some(origin) = overrun else { return };

        let err = EngineError::Timeout {
            limit_mins: budget_mins,
        };
        tracing::warn!(?origin, error = %err, "run exceeded execution budget, stopping");
        self.interpreter.stop();

        if let RunOrigin::Cycle { .. } = origin {
            let mut guard = self.program.lock().await;
            if let Some(program) = guard.as_mut() {
                program.last_error = Some(err.to_string());
            }
        }
    }

    async fn dispatch_due_cycles(&self, now: DateTime<Utc>) {
        let due: Vec<(String, String)> = {
            let guard = self.program.lock().await;
            match guard.as_ref() {
                Some(p) if p.status == ProgramStatus::Running => p
                    .active_cycles
                    .iter()
                    .filter(|c| cycles::is_due(p, c, now))
                    .map(|c| (c.cycle_id.clone(), c.flow_id.clone()))
                    .collect(),
                _ => return,
            }
        };

        for (cycle_id, flow_id) in due {
            if self.device_layer_free().await {
                self.start_cycle_run(&cycle_id, &flow_id, now).await;
            } else {
                // The device layer is claimed: park the flow. The
                // occurrence is consumed either way.
                self.park_cycle_flow(&cycle_id, &flow_id, now).await;
            }
        }
    }

    async fn device_layer_free(&self) -> bool {
        self.active_run.lock().await.is_none() && !self.interpreter.is_busy()
    }

    async fn start_cycle_run(&self, cycle_id: &str, flow_id: &str, now: DateTime<Utc>) {
        let Some(flow) = self.store.get_flow(flow_id).await else {
            let mut guard = self.program.lock().await;
            if let Some(program) = guard.as_mut() {
                program.last_error = Some(format!("flow '{flow_id}' not found"));
            }
            tracing::error!(cycle = %cycle_id, flow = %flow_id, "cycle flow missing");
            return;
        };

        self.consume_occurrence(cycle_id, now, true).await;
        let run = self.spawn_run(
            flow,
            RunOrigin::Cycle {
                cycle_id: cycle_id.to_string(),
            },
            now,
        );
        *self.active_run.lock().await = Some(run);
        tracing::info!(cycle = %cycle_id, flow = %flow_id, "▶ cycle dispatched");
    }

    async fn park_cycle_flow(&self, cycle_id: &str, flow_id: &str, now: DateTime<Utc>) {
        let flow_name = self
            .store
            .get_flow(flow_id)
            .await
            .map(|f| f.name)
            .unwrap_or_else(|| flow_id.to_string());
        let owner = self
            .program
            .lock()
            .await
            .as_ref()
            .map(|p| p.program_id.clone())
            .unwrap_or_else(|| MANUAL_OWNER.to_string());

        match self
            .queue
            .lock()
            .await
            .enqueue(flow_id, &flow_name, &owner, 0, now)
        {
            Ok(()) => tracing::info!(cycle = %cycle_id, flow = %flow_id, "device layer busy, flow parked"),
            Err(e) => tracing::warn!(cycle = %cycle_id, error = %e, "park ignored"),
        }
        self.consume_occurrence(cycle_id, now, false).await;
    }

    /// Advance a cycle past this occurrence: stamp `last_executed` and move
    /// `next_execution` to the next daily slot.
    async fn consume_occurrence(&self, cycle_id: &str, now: DateTime<Utc>, executing: bool) {
        let mut guard = self.program.lock().await;
        let Some(program) = guard.as_mut() else { return };
        let Some(cycle) = program.cycle_mut(cycle_id) else { return };
        cycle.is_currently_executing = executing;
        cycle.last_executed = Some(now);
        match cycles::next_occurrence(&cycle.start_time, now) {
            Ok(next) => cycle.next_execution = next,
            Err(e) => tracing::error!(cycle = %cycle_id, error = %e, "failed to reschedule cycle"),
        }
    }

    async fn drain_queue(&self, now: DateTime<Utc>) {
        if !self.device_layer_free().await {
            return;
        }
        let Some(item) = self.queue.lock().await.take_next() else {
            return;
        };
        let Some(flow) = self.store.get_flow(&item.flow_id).await else {
            self.queue
                .lock()
                .await
                .mark_failed(&item.flow_id, "flow not found");
            tracing::error!(flow = %item.flow_id, "queued flow missing from store");
            return;
        };

        let run = self.spawn_run(flow, RunOrigin::Queued, now);
        *self.active_run.lock().await = Some(run);
        tracing::info!(flow = %item.flow_id, attempts = item.execution_attempts, "▶ queued flow dispatched");
    }

    fn spawn_run(&self, flow: Flow, origin: RunOrigin, now: DateTime<Utc>) -> ActiveRun {
        let interpreter = Arc::clone(&self.interpreter);
        let flow_id = flow.id.clone();
        let handle = tokio::spawn(async move { interpreter.run(&flow, HashMap::new()).await });
        ActiveRun {
            origin,
            flow_id,
            started_at: now,
            timed_out: false,
            handle,
        }
    }

    async fn persist(&self) {
        if let Some(program) = self.program.lock().await.as_ref() {
            if let Err(e) = self.store.save_active_program(program).await {
                tracing::warn!(error = %e, "failed to persist active program");
            }
        }
        let items = self.queue.lock().await.items().to_vec();
        if let Err(e) = self.store.save_queue(&items).await {
            tracing::warn!(error = %e, "failed to persist queue");
        }
    }
}
