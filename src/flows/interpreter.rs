//! Block-execution state machine.
//!
//! One cursor walks the graph block by block. Pause and stop requests arrive
//! over a watch channel and are observed at block boundaries, inside WAIT
//! timers, and immediately before any device command commits. Exactly one
//! run is active at a time; the scheduler enforces that by owning the single
//! run slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::events::{FlowEvent, FlowEventKind};
use super::graph::FlowGraph;
use super::validator::{self, error_count};
use super::{
    Block, BlockKind, CompareOp, Flow, FlowControlKind, LogLevel, LoopMode, Operand, VariableScope,
    port,
};
use crate::devices::{ActuatorAction, ActuatorParams, DeviceBus, Reading};
use crate::error::EngineError;
use crate::units;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub scope: VariableScope,
}

/// Run-scoped variable store. A variable's unit is fixed the first time it
/// is known and incoming values are converted into it.
#[derive(Debug, Default, Clone)]
pub struct VariableStore {
    vars: HashMap<String, Variable>,
}

impl VariableStore {
    pub fn declare(
        &mut self,
        name: &str,
        unit: Option<String>,
        scope: VariableScope,
    ) -> Result<(), EngineError> {
        if let Some(existing) = self.vars.get(name) {
            if let (Some(have), Some(incoming)) = (&existing.unit, &unit) {
                if have != incoming {
                    return Err(EngineError::Program(format!(
                        "variable '{name}' is already declared with unit '{have}'"
                    )));
                }
            }
            return Ok(());
        }
        self.vars.insert(
            name.to_string(),
            Variable {
                value: None,
                unit,
                scope,
            },
        );
        Ok(())
    }

    pub fn write(&mut self, name: &str, value: f64, unit: Option<&str>) -> Result<f64, EngineError> {
        let entry = self.vars.entry(name.to_string()).or_insert(Variable {
            value: None,
            unit: None,
            scope: VariableScope::Local,
        });
        let stored = match (&entry.unit, unit) {
            (Some(have), Some(incoming)) if have != incoming => {
                units::convert(value, incoming, have)?
            }
            (None, Some(incoming)) => {
                entry.unit = Some(incoming.to_string());
                value
            }
            _ => value,
        };
        entry.value = Some(stored);
        Ok(stored)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    fn value_of(&self, name: &str) -> Result<(f64, Option<&str>), EngineError> {
        let var = self
            .vars
            .get(name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?;
        let value = var
            .value
            .ok_or_else(|| EngineError::UnknownVariable(format!("{name} has no value yet")))?;
        Ok((value, var.unit.as_deref()))
    }

    pub fn snapshot(&self) -> HashMap<String, Variable> {
        self.vars.clone()
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub executed_blocks: Vec<String>,
    pub variables: HashMap<String, Variable>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    Stopped,
    Failed(EngineError),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// Where the cursor goes after a block finishes.
enum Step {
    /// Follow a named outgoing port.
    Follow(&'static str),
    /// Transfer the cursor directly, no graph edge required.
    Jump(String),
    /// Natural end of the flow.
    Done,
    /// A stop request was observed mid-block.
    Halt,
}

enum Checkpoint {
    Continue,
    Stopped,
}

struct LoopRun {
    iterations: u32,
    completed: bool,
    entered: Instant,
}

struct RunCtx<'a> {
    flow_id: &'a str,
    run_id: &'a str,
}

pub struct FlowInterpreter {
    bus: Arc<dyn DeviceBus>,
    events_tx: broadcast::Sender<FlowEvent>,
    control: watch::Sender<ControlSignal>,
    state: watch::Sender<RunState>,
}

impl FlowInterpreter {
    pub fn new(bus: Arc<dyn DeviceBus>, events_tx: broadcast::Sender<FlowEvent>) -> Self {
        let (control, _) = watch::channel(ControlSignal::Run);
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            bus,
            events_tx,
            control,
            state,
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state(), RunState::Running | RunState::Paused)
    }

    /// Cooperative: observed at the next block boundary or suspension point.
    pub fn pause(&self) {
        self.control.send_replace(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        self.control.send_replace(ControlSignal::Run);
    }

    /// Cancels any pending timer or device operation and discards the cursor.
    pub fn stop(&self) {
        self.control.send_replace(ControlSignal::Stop);
    }

    fn emit(&self, ctx: &RunCtx<'_>, block_id: Option<&str>, kind: FlowEventKind, message: String) {
        let _ = self.events_tx.send(FlowEvent {
            flow_id: ctx.flow_id.to_string(),
            run_id: ctx.run_id.to_string(),
            timestamp: Utc::now(),
            block_id: block_id.map(String::from),
            kind,
            message,
        });
    }

    fn set_state(&self, ctx: &RunCtx<'_>, next: RunState) {
        let previous = *self.state.borrow();
        if previous != next {
            self.state.send_replace(next);
            self.emit(
                ctx,
                None,
                FlowEventKind::StateChanged,
                format!("{previous:?} -> {next:?}"),
            );
        }
    }

    /// Validate and execute a flow to completion, stop, or error.
    /// Validation errors refuse the run before it ever reaches `Running`.
    pub async fn run(&self, flow: &Flow, globals: HashMap<String, f64>) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let ctx = RunCtx {
            flow_id: &flow.id,
            run_id: &run_id,
        };

        let issues = validator::validate(flow);
        let errors = error_count(&issues);
        if errors > 0 {
            tracing::warn!(flow = %flow.name, errors, "refusing to run invalid flow");
            self.emit(
                &ctx,
                None,
                FlowEventKind::ErrorOccurred,
                format!("validation failed with {errors} error(s)"),
            );
            return RunOutcome::Failed(EngineError::ValidationFailed(errors));
        }
        let graph = match FlowGraph::build(flow) {
            Ok(graph) => graph,
            Err(dangling) => {
                return RunOutcome::Failed(EngineError::ValidationFailed(dangling.len()));
            }
        };
        let Some(start) = flow
            .blocks
            .iter()
            .find(|b| matches!(b.kind, BlockKind::Start))
        else {
            return RunOutcome::Failed(EngineError::ValidationFailed(1));
        };

        let mut vars = VariableStore::default();
        for decl in &flow.variables {
            if let Err(e) = vars.declare(&decl.name, decl.unit.clone(), decl.scope) {
                return RunOutcome::Failed(e);
            }
        }
        for (name, value) in &globals {
            if let Err(e) = vars.write(name, *value, None) {
                return RunOutcome::Failed(e);
            }
        }

        self.control.send_replace(ControlSignal::Run);
        let mut control_rx = self.control.subscribe();
        control_rx.mark_unchanged();

        self.set_state(&ctx, RunState::Running);
        self.emit(
            &ctx,
            None,
            FlowEventKind::FlowStarted,
            format!("flow '{}' started", flow.name),
        );
        tracing::info!(flow = %flow.name, run = %&run_id[..8], blocks = flow.blocks.len(), "▶ flow started");
        let started = Instant::now();

        let mut cursor = start.id.clone();
        let mut executed: Vec<String> = Vec::new();
        let mut loops: HashMap<String, LoopRun> = HashMap::new();
        let mut loop_stack: Vec<String> = Vec::new();

        loop {
            if let Checkpoint::Stopped = self.checkpoint(&ctx, &mut control_rx).await {
                return self.finish_stopped(&ctx, flow, started);
            }

            let Some(block) = graph.block(&cursor) else {
                return self.finish_error(&ctx, EngineError::UnknownBlock(cursor));
            };
            let block = block.clone();

            let step = match self
                .exec_block(&graph, &block, &ctx, &mut vars, &mut loops, &mut loop_stack, &mut control_rx)
                .await
            {
                Ok(step) => step,
                Err(e) => return self.finish_error(&ctx, e),
            };

            // An interrupted block did not execute; no completion event.
            if let Step::Halt = step {
                return self.finish_stopped(&ctx, flow, started);
            }

            executed.push(block.id.clone());
            self.emit(
                &ctx,
                Some(&block.id),
                FlowEventKind::BlockExecuted,
                format!("{} executed", block.kind.name()),
            );

            match step {
                Step::Follow(out_port) => match graph.first_target(&block.id, out_port) {
                    Some(next) => cursor = next.to_string(),
                    // Dangling port: the flow simply ends here.
                    None => break,
                },
                Step::Jump(target) => cursor = target,
                Step::Done | Step::Halt => break,
            }
        }

        let elapsed = started.elapsed();
        self.emit(
            &ctx,
            None,
            FlowEventKind::FlowCompleted,
            format!("completed in {:.1}s", elapsed.as_secs_f64()),
        );
        tracing::info!(flow = %flow.name, elapsed = format_args!("{:.1}s", elapsed.as_secs_f64()), "✓ flow completed");
        self.set_state(&ctx, RunState::Idle);
        RunOutcome::Completed(RunReport {
            run_id,
            executed_blocks: executed,
            variables: vars.snapshot(),
        })
    }

    fn finish_stopped(&self, ctx: &RunCtx<'_>, flow: &Flow, started: Instant) -> RunOutcome {
        self.emit(
            ctx,
            None,
            FlowEventKind::FlowStopped,
            format!("stopped after {:.1}s", started.elapsed().as_secs_f64()),
        );
        tracing::info!(flow = %flow.name, "■ flow stopped");
        self.set_state(ctx, RunState::Stopped);
        RunOutcome::Stopped
    }

    fn finish_error(&self, ctx: &RunCtx<'_>, err: EngineError) -> RunOutcome {
        self.emit(ctx, None, FlowEventKind::ErrorOccurred, err.to_string());
        tracing::error!(flow = %ctx.flow_id, error = %err, "✗ flow failed");
        self.set_state(ctx, RunState::Error);
        RunOutcome::Failed(err)
    }

    /// Observe the control channel. Blocks while paused; returns `Stopped`
    /// when a stop request is seen.
    async fn checkpoint(
        &self,
        ctx: &RunCtx<'_>,
        rx: &mut watch::Receiver<ControlSignal>,
    ) -> Checkpoint {
        loop {
            let signal = *rx.borrow_and_update();
            match signal {
                ControlSignal::Run => {
                    if self.state() == RunState::Paused {
                        self.set_state(ctx, RunState::Running);
                    }
                    return Checkpoint::Continue;
                }
                ControlSignal::Stop => return Checkpoint::Stopped,
                ControlSignal::Pause => {
                    if self.state() != RunState::Paused {
                        self.set_state(ctx, RunState::Paused);
                        self.emit(
                            ctx,
                            None,
                            FlowEventKind::FlowPaused,
                            "flow paused".to_string(),
                        );
                        tracing::info!(flow = %ctx.flow_id, "⏸ flow paused");
                    }
                    if rx.changed().await.is_err() {
                        return Checkpoint::Stopped;
                    }
                }
            }
        }
    }

    /// Sleep that honors pause and stop. The deadline is wall-clock: time
    /// spent paused still counts against the wait.
    async fn wait_cancellable(
        &self,
        ctx: &RunCtx<'_>,
        duration: Duration,
        rx: &mut watch::Receiver<ControlSignal>,
    ) -> Checkpoint {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if let Checkpoint::Stopped = self.checkpoint(ctx, rx).await {
                return Checkpoint::Stopped;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Checkpoint::Continue,
                res = rx.changed() => {
                    if res.is_err() {
                        return Checkpoint::Continue;
                    }
                }
            }
        }
    }

    async fn device_read(
        &self,
        device_id: &str,
        rx: &mut watch::Receiver<ControlSignal>,
    ) -> Result<Option<Reading>, EngineError> {
        tokio::select! {
            reading = self.bus.read(device_id) => reading.map(Some),
            _ = wait_for_stop(rx) => Ok(None),
        }
    }

    async fn device_write(
        &self,
        device_id: &str,
        action: ActuatorAction,
        params: &ActuatorParams,
        rx: &mut watch::Receiver<ControlSignal>,
    ) -> Result<Option<()>, EngineError> {
        tokio::select! {
            ack = self.bus.write(device_id, action, params) => ack.map(Some),
            _ = wait_for_stop(rx) => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exec_block(
        &self,
        graph: &FlowGraph,
        block: &Block,
        ctx: &RunCtx<'_>,
        vars: &mut VariableStore,
        loops: &mut HashMap<String, LoopRun>,
        loop_stack: &mut Vec<String>,
        rx: &mut watch::Receiver<ControlSignal>,
    ) -> Result<Step, EngineError> {
        match &block.kind {
            BlockKind::Start => Ok(Step::Follow(port::FLOW_OUT)),
            BlockKind::End => Ok(Step::Done),

            BlockKind::SensorRead {
                device_id,
                variable,
                strategy,
            } => {
                let Some(reading) = self.device_read(device_id, rx).await? else {
                    return Ok(Step::Halt);
                };
                let out_unit = strategy.resolve_output_unit(&reading.unit);
                let calibrated = strategy.apply(reading.raw, None);
                let stored = vars.write(variable, calibrated, Some(&out_unit))?;
                let final_unit = vars
                    .get(variable)
                    .and_then(|v| v.unit.clone())
                    .unwrap_or_else(|| out_unit.clone());
                self.emit(
                    ctx,
                    Some(&block.id),
                    FlowEventKind::VariableUpdated,
                    format!("{variable} = {stored} {final_unit}"),
                );
                tracing::debug!(device = %device_id, %variable, value = stored, unit = %final_unit, "sensor read");
                Ok(Step::Follow(port::FLOW_OUT))
            }

            BlockKind::ActuatorSet {
                device_id,
                action,
                value,
                duration_secs,
                power_level,
            } => {
                // A pause request must win over a queued device command.
                if let Checkpoint::Stopped = self.checkpoint(ctx, rx).await {
                    return Ok(Step::Halt);
                }
                let params = ActuatorParams {
                    value: *value,
                    duration_secs: *duration_secs,
                    power_level: *power_level,
                };
                match self.device_write(device_id, *action, &params, rx).await? {
                    Some(()) => {
                        tracing::debug!(device = %device_id, ?action, "actuator command sent");
                        Ok(Step::Follow(port::FLOW_OUT))
                    }
                    None => Ok(Step::Halt),
                }
            }

            BlockKind::Wait { duration_secs } => {
                match self
                    .wait_cancellable(ctx, Duration::from_secs(*duration_secs), rx)
                    .await
                {
                    Checkpoint::Continue => Ok(Step::Follow(port::FLOW_OUT)),
                    Checkpoint::Stopped => Ok(Step::Halt),
                }
            }

            BlockKind::If {
                variable,
                operator,
                value,
            } => {
                let outcome = eval_comparison(vars, variable, *operator, value)?;
                tracing::debug!(block = %block.id, %variable, result = outcome, "if evaluated");
                Ok(Step::Follow(if outcome { port::TRUE } else { port::FALSE }))
            }

            BlockKind::Loop {
                mode,
                stop_condition,
                delay_secs,
            } => {
                let state = loops.entry(block.id.clone()).or_insert_with(|| LoopRun {
                    iterations: 0,
                    completed: false,
                    entered: Instant::now(),
                });

                if state.completed {
                    pop_loop(loop_stack, &block.id);
                    return Ok(Step::Follow(port::EXIT));
                }

                if let Some(cond) = stop_condition {
                    if eval_comparison(vars, &cond.variable, cond.operator, &cond.value)? {
                        state.completed = true;
                        pop_loop(loop_stack, &block.id);
                        tracing::debug!(block = %block.id, "loop ended by stop condition");
                        return Ok(Step::Follow(port::EXIT));
                    }
                }

                let exhausted = match mode {
                    LoopMode::Count {
                        max_iterations,
                        count_variable,
                    } => {
                        let limit = match count_variable {
                            Some(name) => vars.value_of(name)?.0.max(0.0) as u32,
                            None => *max_iterations,
                        };
                        state.iterations >= limit
                    }
                    LoopMode::Time { budget_secs } => {
                        state.entered.elapsed() >= Duration::from_secs(*budget_secs)
                    }
                };

                if exhausted {
                    state.completed = true;
                    pop_loop(loop_stack, &block.id);
                    tracing::debug!(block = %block.id, iterations = state.iterations, "loop exhausted");
                    return Ok(Step::Follow(port::EXIT));
                }

                state.iterations += 1;
                if *delay_secs > 0 {
                    if let Checkpoint::Stopped = self
                        .wait_cancellable(ctx, Duration::from_secs(*delay_secs), rx)
                        .await
                    {
                        return Ok(Step::Halt);
                    }
                }
                if loop_stack.last() != Some(&block.id) {
                    loop_stack.push(block.id.clone());
                }
                Ok(Step::Follow(port::BODY))
            }

            BlockKind::FlowControl(kind) => match kind {
                FlowControlKind::Label => Ok(Step::Follow(port::FLOW_OUT)),
                FlowControlKind::Goto { target } => {
                    if !graph.contains(target) {
                        return Err(EngineError::UnknownBlock(target.clone()));
                    }
                    Ok(Step::Jump(target.clone()))
                }
                FlowControlKind::LoopBack { loop_id } => {
                    let owner = resolve_owner(loop_id.as_deref(), loop_stack)?;
                    Ok(Step::Jump(owner))
                }
                FlowControlKind::LoopBreak { loop_id } => {
                    let owner = resolve_owner(loop_id.as_deref(), loop_stack)?;
                    if let Some(state) = loops.get_mut(&owner) {
                        state.completed = true;
                    }
                    loop_stack.retain(|id| id != &owner);
                    match graph.first_target(&owner, port::EXIT) {
                        Some(next) => Ok(Step::Jump(next.to_string())),
                        None => Ok(Step::Done),
                    }
                }
            },

            BlockKind::Log { message, level } => {
                match level {
                    LogLevel::Debug => tracing::debug!(flow = %ctx.flow_id, block = %block.id, "{message}"),
                    LogLevel::Info => tracing::info!(flow = %ctx.flow_id, block = %block.id, "{message}"),
                    LogLevel::Warn => tracing::warn!(flow = %ctx.flow_id, block = %block.id, "{message}"),
                    LogLevel::Error => tracing::error!(flow = %ctx.flow_id, block = %block.id, "{message}"),
                }
                Ok(Step::Follow(port::FLOW_OUT))
            }
        }
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<ControlSignal>) {
    loop {
        if *rx.borrow_and_update() == ControlSignal::Stop {
            return;
        }
        if rx.changed().await.is_err() {
            // Channel owner is gone; nothing will ever request a stop.
            std::future::pending::<()>().await;
        }
    }
}

fn pop_loop(stack: &mut Vec<String>, loop_id: &str) {
    if stack.last().map(String::as_str) == Some(loop_id) {
        stack.pop();
    }
}

fn resolve_owner(explicit: Option<&str>, stack: &[String]) -> Result<String, EngineError> {
    explicit
        .map(String::from)
        .or_else(|| stack.last().cloned())
        .ok_or_else(|| EngineError::UnknownBlock("no owning loop for control jump".to_string()))
}

/// Compare a variable against an operand, converting the right side into the
/// variable's unit when both units are known.
fn eval_comparison(
    vars: &VariableStore,
    variable: &str,
    operator: CompareOp,
    value: &Operand,
) -> Result<bool, EngineError> {
    let (left, left_unit) = vars.value_of(variable)?;
    let right = match value {
        Operand::Literal { value, unit } => match (unit, left_unit) {
            (Some(from), Some(to)) if from != to => units::convert(*value, from, to)?,
            _ => *value,
        },
        Operand::Variable { name } => {
            let (raw, right_unit) = vars.value_of(name)?;
            match (right_unit, left_unit) {
                (Some(from), Some(to)) if from != to => units::convert(raw, from, to)?,
                _ => raw,
            }
        }
    };
    Ok(operator.eval(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalPoint, CalibrationStrategy};
    use crate::devices::SimulatedBus;
    use crate::flows::Condition;

    fn interpreter(bus: Arc<SimulatedBus>) -> Arc<FlowInterpreter> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(FlowInterpreter::new(bus, events_tx))
    }

    fn interpreter_with_events(
        bus: Arc<SimulatedBus>,
    ) -> (Arc<FlowInterpreter>, broadcast::Receiver<FlowEvent>) {
        let (events_tx, events_rx) = broadcast::channel(64);
        (Arc::new(FlowInterpreter::new(bus, events_tx)), events_rx)
    }

    fn drain(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn linear_flow_completes() {
        let bus = Arc::new(SimulatedBus::new());
        let (interp, mut events_rx) = interpreter_with_events(bus);

        let outcome = interp.run(&Flow::linear("f", "linear"), HashMap::new()).await;
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.executed_blocks, vec!["start", "end"]);

        let kinds: Vec<_> = drain(&mut events_rx).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&FlowEventKind::FlowStarted));
        assert!(kinds.contains(&FlowEventKind::FlowCompleted));
        assert_eq!(interp.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn validation_failure_prevents_run() {
        let bus = Arc::new(SimulatedBus::new());
        let (interp, mut events_rx) = interpreter_with_events(bus);

        let flow = Flow::new("f", "no-start").with_block("end", BlockKind::End);
        let outcome = interp.run(&flow, HashMap::new()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(EngineError::ValidationFailed(_))
        ));
        // The run never reached RUNNING.
        let kinds: Vec<_> = drain(&mut events_rx).iter().map(|e| e.kind).collect();
        assert!(!kinds.contains(&FlowEventKind::FlowStarted));
        assert_eq!(interp.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn sensor_read_calibrates_and_converts() {
        let bus = Arc::new(SimulatedBus::new());
        bus.set_reading("level-sensor", 300.0, "mm").await;
        let (interp, mut events_rx) = interpreter_with_events(bus);

        let flow = Flow::new("f", "tank")
            .with_variable("tank_volume", Some("ml"))
            .with_block("start", BlockKind::Start)
            .with_block(
                "read",
                BlockKind::SensorRead {
                    device_id: "level-sensor".into(),
                    variable: "tank_volume".into(),
                    strategy: CalibrationStrategy::LinearLookup {
                        points: vec![
                            CalPoint {
                                raw: 100.0,
                                value: 200.0,
                            },
                            CalPoint {
                                raw: 500.0,
                                value: 40.0,
                            },
                        ],
                        output_unit: "l".into(),
                    },
                },
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "read")
            .with_connection("read", port::FLOW_OUT, "end");

        let RunOutcome::Completed(report) = interp.run(&flow, HashMap::new()).await else {
            panic!("expected completion");
        };
        // 300 mm interpolates to 120 l, stored in the variable's ml unit.
        let var = &report.variables["tank_volume"];
        assert_eq!(var.value, Some(120_000.0));
        assert_eq!(var.unit.as_deref(), Some("ml"));

        let events = drain(&mut events_rx);
        assert!(events
            .iter()
            .any(|e| e.kind == FlowEventKind::VariableUpdated));
    }

    #[tokio::test]
    async fn if_converts_across_units_before_comparing() {
        let bus = Arc::new(SimulatedBus::new());
        bus.set_reading("level-sensor", 1.0, "l").await;
        let interp = interpreter(bus);

        // 1 l > 500 ml must take the true branch.
        let flow = Flow::new("f", "compare")
            .with_variable("level", Some("l"))
            .with_block("start", BlockKind::Start)
            .with_block(
                "read",
                BlockKind::SensorRead {
                    device_id: "level-sensor".into(),
                    variable: "level".into(),
                    strategy: CalibrationStrategy::Raw,
                },
            )
            .with_block(
                "cmp",
                BlockKind::If {
                    variable: "level".into(),
                    operator: CompareOp::Gt,
                    value: Operand::Literal {
                        value: 500.0,
                        unit: Some("ml".into()),
                    },
                },
            )
            .with_block("end-true", BlockKind::End)
            .with_block("end-false", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "read")
            .with_connection("read", port::FLOW_OUT, "cmp")
            .with_connection("cmp", port::TRUE, "end-true")
            .with_connection("cmp", port::FALSE, "end-false");

        let RunOutcome::Completed(report) = interp.run(&flow, HashMap::new()).await else {
            panic!("expected completion");
        };
        assert!(report.executed_blocks.contains(&"end-true".to_string()));
        assert!(!report.executed_blocks.contains(&"end-false".to_string()));
    }

    fn count_loop_flow(max_iterations: u32) -> Flow {
        Flow::new("f", "count-loop")
            .with_block("start", BlockKind::Start)
            .with_block(
                "loop",
                BlockKind::Loop {
                    mode: LoopMode::Count {
                        max_iterations,
                        count_variable: None,
                    },
                    stop_condition: None,
                    delay_secs: 0,
                },
            )
            .with_block(
                "tick",
                BlockKind::Log {
                    message: "tick".into(),
                    level: LogLevel::Debug,
                },
            )
            .with_block(
                "back",
                BlockKind::FlowControl(FlowControlKind::LoopBack { loop_id: None }),
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "loop")
            .with_connection("loop", port::BODY, "tick")
            .with_connection("tick", port::FLOW_OUT, "back")
            .with_connection("loop", port::EXIT, "end")
    }

    #[tokio::test]
    async fn count_loop_runs_body_exactly_three_times() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(bus);

        let RunOutcome::Completed(report) =
            interp.run(&count_loop_flow(3), HashMap::new()).await
        else {
            panic!("expected completion");
        };
        let body_visits = report
            .executed_blocks
            .iter()
            .filter(|id| id.as_str() == "tick")
            .count();
        assert_eq!(body_visits, 3);
        assert!(report.executed_blocks.contains(&"end".to_string()));
    }

    #[tokio::test]
    async fn loop_stop_condition_short_circuits_the_body() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(bus);

        let mut flow = count_loop_flow(5).with_variable("target", None);
        for block in &mut flow.blocks {
            if block.id == "loop" {
                block.kind = BlockKind::Loop {
                    mode: LoopMode::Count {
                        max_iterations: 5,
                        count_variable: None,
                    },
                    stop_condition: Some(Condition {
                        variable: "target".into(),
                        operator: CompareOp::Ge,
                        value: Operand::Literal {
                            value: 3.0,
                            unit: None,
                        },
                    }),
                    delay_secs: 0,
                };
            }
        }

        let globals = HashMap::from([("target".to_string(), 5.0)]);
        let RunOutcome::Completed(report) = interp.run(&flow, globals).await else {
            panic!("expected completion");
        };
        assert!(!report.executed_blocks.contains(&"tick".to_string()));
        assert!(report.executed_blocks.contains(&"end".to_string()));
    }

    #[tokio::test]
    async fn device_failure_is_fatal_to_the_run() {
        let bus = Arc::new(SimulatedBus::new());
        let (interp, mut events_rx) = interpreter_with_events(bus);

        let flow = Flow::new("f", "broken-device")
            .with_variable("x", None)
            .with_block("start", BlockKind::Start)
            .with_block(
                "read",
                BlockKind::SensorRead {
                    device_id: "missing".into(),
                    variable: "x".into(),
                    strategy: CalibrationStrategy::Raw,
                },
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "read")
            .with_connection("read", port::FLOW_OUT, "end");

        let outcome = interp.run(&flow, HashMap::new()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(EngineError::DeviceIo(_))
        ));
        assert_eq!(interp.state(), RunState::Error);
        let kinds: Vec<_> = drain(&mut events_rx).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&FlowEventKind::ErrorOccurred));
    }

    #[tokio::test]
    async fn goto_transfers_the_cursor_without_an_edge() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(bus);

        let flow = Flow::new("f", "goto")
            .with_block("start", BlockKind::Start)
            .with_block(
                "jump",
                BlockKind::FlowControl(FlowControlKind::Goto {
                    target: "end".into(),
                }),
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "jump");

        let RunOutcome::Completed(report) = interp.run(&flow, HashMap::new()).await else {
            panic!("expected completion");
        };
        assert_eq!(report.executed_blocks, vec!["start", "jump", "end"]);
    }

    #[tokio::test]
    async fn loop_back_outside_a_loop_is_a_run_error() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(bus);

        let flow = Flow::new("f", "stray-back")
            .with_block("start", BlockKind::Start)
            .with_block(
                "back",
                BlockKind::FlowControl(FlowControlKind::LoopBack { loop_id: None }),
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "back")
            .with_connection("back", port::FLOW_OUT, "end");

        let outcome = interp.run(&flow, HashMap::new()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(EngineError::UnknownBlock(_))
        ));
    }

    #[tokio::test]
    async fn stop_interrupts_a_wait() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(bus);

        let flow = Flow::new("f", "long-wait")
            .with_block("start", BlockKind::Start)
            .with_block("wait", BlockKind::Wait { duration_secs: 3600 })
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "wait")
            .with_connection("wait", port::FLOW_OUT, "end");

        let runner = Arc::clone(&interp);
        let handle = tokio::spawn(async move { runner.run(&flow, HashMap::new()).await });

        let mut state_rx = interp.subscribe_state();
        while *state_rx.borrow() != RunState::Running {
            state_rx.changed().await.unwrap();
        }
        interp.stop();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(interp.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn double_pause_is_idempotent() {
        let bus = Arc::new(SimulatedBus::new());
        let (interp, mut events_rx) = interpreter_with_events(bus);

        let flow = Flow::new("f", "pausable")
            .with_block("start", BlockKind::Start)
            .with_block("wait", BlockKind::Wait { duration_secs: 3600 })
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "wait")
            .with_connection("wait", port::FLOW_OUT, "end");

        let runner = Arc::clone(&interp);
        let handle = tokio::spawn(async move { runner.run(&flow, HashMap::new()).await });

        let mut state_rx = interp.subscribe_state();
        while *state_rx.borrow() != RunState::Running {
            state_rx.changed().await.unwrap();
        }

        interp.pause();
        while *state_rx.borrow() != RunState::Paused {
            state_rx.changed().await.unwrap();
        }
        interp.pause();
        tokio::task::yield_now().await;
        assert_eq!(interp.state(), RunState::Paused);

        let paused_events = drain(&mut events_rx)
            .iter()
            .filter(|e| e.kind == FlowEventKind::FlowPaused)
            .count();
        assert_eq!(paused_events, 1);

        interp.stop();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped));
    }

    #[tokio::test]
    async fn actuator_commands_reach_the_bus() {
        let bus = Arc::new(SimulatedBus::new());
        let interp = interpreter(Arc::clone(&bus));

        let flow = Flow::new("f", "dose")
            .with_block("start", BlockKind::Start)
            .with_block(
                "pump",
                BlockKind::ActuatorSet {
                    device_id: "pump-1".into(),
                    action: ActuatorAction::Dose,
                    value: Some(25.0),
                    duration_secs: None,
                    power_level: None,
                },
            )
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "pump")
            .with_connection("pump", port::FLOW_OUT, "end");

        let outcome = interp.run(&flow, HashMap::new()).await;
        assert!(outcome.is_completed());
        let commands = bus.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1, ActuatorAction::Dose);
    }

    #[test]
    fn variable_unit_is_immutable_after_declaration() {
        let mut store = VariableStore::default();
        store
            .declare("level", Some("l".into()), VariableScope::Local)
            .unwrap();
        assert!(store
            .declare("level", Some("ml".into()), VariableScope::Local)
            .is_err());
        // Same unit re-declaration is fine.
        assert!(store
            .declare("level", Some("l".into()), VariableScope::Local)
            .is_ok());
    }

    #[test]
    fn write_converts_into_the_declared_unit() {
        let mut store = VariableStore::default();
        store
            .declare("level", Some("l".into()), VariableScope::Local)
            .unwrap();
        let stored = store.write("level", 1500.0, Some("ml")).unwrap();
        assert_eq!(stored, 1.5);
        assert!(store.write("level", 20.0, Some("C")).is_err());
    }
}
