//! Two-pass flow validation. Never fails: all findings are collected into a
//! list of issues, and a run is only refused when that list contains errors.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::graph::FlowGraph;
use super::{Block, BlockKind, Condition, Flow, FlowControlKind, LoopMode, Operand, port};
use crate::units;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub block_id: Option<String>,
    pub field: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn error(block_id: Option<&str>, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            block_id: block_id.map(String::from),
            field: field.map(String::from),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(block_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            block_id: block_id.map(String::from),
            field: None,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

pub fn error_count(issues: &[ValidationIssue]) -> usize {
    issues.iter().filter(|i| i.severity == Severity::Error).count()
}

pub fn validate(flow: &Flow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let graph = match FlowGraph::build(flow) {
        Ok(graph) => graph,
        Err(dangling) => {
            for id in dangling {
                issues.push(ValidationIssue::error(
                    Some(&id),
                    None,
                    format!("connection references unknown block '{id}'"),
                ));
            }
            return issues;
        }
    };

    structural_pass(flow, &graph, &mut issues);
    for block in &flow.blocks {
        field_pass(flow, &graph, block, &mut issues);
    }
    issues
}

fn structural_pass(flow: &Flow, graph: &FlowGraph, issues: &mut Vec<ValidationIssue>) {
    let starts: Vec<&Block> = flow
        .blocks
        .iter()
        .filter(|b| matches!(b.kind, BlockKind::Start))
        .collect();
    let ends: Vec<&Block> = flow
        .blocks
        .iter()
        .filter(|b| matches!(b.kind, BlockKind::End))
        .collect();

    match starts.len() {
        0 => issues.push(ValidationIssue::error(None, None, "missing start block")),
        1 => {}
        n => issues.push(ValidationIssue::error(
            None,
            None,
            format!("flow has {n} start blocks, expected exactly one"),
        )),
    }
    if ends.is_empty() {
        issues.push(ValidationIssue::error(None, None, "missing end block"));
    }

    let Some(start) = starts.first() else {
        return;
    };

    let reachable = graph.all_reachable(&start.id);
    for block in &flow.blocks {
        if !reachable.contains(&block.id) {
            issues.push(ValidationIssue::warning(
                Some(&block.id),
                format!("block '{}' is not connected to the start block", block.id),
            ));
        }
    }

    // Dead-end check: every reachable block must be able to finish the flow,
    // either through an END block or through a jump-style FLOW_CONTROL.
    for id in &reachable {
        if !reaches_exit(graph, id) {
            issues.push(ValidationIssue::error(
                Some(id),
                None,
                format!("block '{id}' is a dead end: no path to an end block"),
            ));
        }
    }

    // Loop body closure: inside a loop body only LOOP_BACK and LABEL are
    // acceptable control transitions.
    for block in &flow.blocks {
        if let BlockKind::Loop { .. } = block.kind {
            for body_id in loop_body(graph, &block.id) {
                if let Some(BlockKind::FlowControl(kind)) = graph.block(&body_id).map(|b| &b.kind)
                {
                    if !matches!(kind, FlowControlKind::LoopBack { .. } | FlowControlKind::Label)
                    {
                        issues.push(ValidationIssue::warning(
                            Some(&body_id),
                            format!(
                                "loop '{}' body is not closed by a loop-back: found {} control",
                                block.id,
                                control_name(kind)
                            ),
                        ));
                    }
                }
            }
        }
    }
}

/// Can this block reach an END, or a FLOW_CONTROL exit point other than a
/// plain LABEL? Iterative BFS; the graph may be cyclic.
fn reaches_exit(graph: &FlowGraph, from: &str) -> bool {
    let mut visited = HashSet::new();
    let mut queue = vec![from.to_string()];
    while let Some(current) = queue.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        match graph.block(&current).map(|b| &b.kind) {
            Some(BlockKind::End) => return true,
            Some(BlockKind::FlowControl(kind))
                if !matches!(kind, FlowControlKind::Label) =>
            {
                return true;
            }
            _ => {}
        }
        for conn in graph.follow_connections(&current, port::FLOW_OUT) {
            queue.push(conn.target_block.clone());
        }
        for p in [port::TRUE, port::FALSE, port::BODY, port::EXIT] {
            for conn in graph.follow_connections(&current, p) {
                queue.push(conn.target_block.clone());
            }
        }
    }
    false
}

/// Blocks belonging to a loop's body subgraph: everything reachable from the
/// `body` port without re-entering the loop head or crossing its exit edge.
fn loop_body(graph: &FlowGraph, loop_id: &str) -> Vec<String> {
    let mut body = Vec::new();
    let mut visited = HashSet::from([loop_id.to_string()]);
    let mut queue: Vec<String> = graph
        .next_blocks(loop_id, port::BODY)
        .into_iter()
        .map(String::from)
        .collect();
    let exits: HashSet<String> = graph
        .next_blocks(loop_id, port::EXIT)
        .into_iter()
        .map(String::from)
        .collect();

    while let Some(current) = queue.pop() {
        if exits.contains(&current) || !visited.insert(current.clone()) {
            continue;
        }
        for p in [port::FLOW_OUT, port::TRUE, port::FALSE, port::BODY, port::EXIT] {
            for next in graph.next_blocks(&current, p) {
                queue.push(next.to_string());
            }
        }
        body.push(current);
    }
    body
}

fn control_name(kind: &FlowControlKind) -> &'static str {
    match kind {
        FlowControlKind::Label => "label",
        FlowControlKind::Goto { .. } => "goto",
        FlowControlKind::LoopBack { .. } => "loop-back",
        FlowControlKind::LoopBreak { .. } => "loop-break",
    }
}

fn field_pass(flow: &Flow, graph: &FlowGraph, block: &Block, issues: &mut Vec<ValidationIssue>) {
    let id = block.id.as_str();
    match &block.kind {
        BlockKind::SensorRead {
            device_id,
            variable,
            strategy,
        } => {
            require_nonempty(id, "device_id", device_id, issues);
            require_nonempty(id, "variable", variable, issues);
            match flow.variable(variable) {
                None if !variable.is_empty() => issues.push(ValidationIssue::error(
                    Some(id),
                    Some("variable"),
                    format!("variable '{variable}' is not declared"),
                )),
                Some(decl) => {
                    // Unit compatibility between the strategy's resolved
                    // output unit and the target variable's unit.
                    if let (Some(out), Some(var_unit)) = (strategy.output_unit(), &decl.unit) {
                        if !units::compatible(out, var_unit) {
                            issues.push(ValidationIssue::error(
                                Some(id),
                                Some("strategy"),
                                format!(
                                    "strategy outputs '{out}' but variable '{variable}' holds '{var_unit}'"
                                ),
                            ));
                        }
                    }
                }
                None => {}
            }
        }
        BlockKind::ActuatorSet { device_id, .. } => {
            require_nonempty(id, "device_id", device_id, issues);
        }
        BlockKind::Wait { duration_secs } => {
            if *duration_secs == 0 {
                issues.push(ValidationIssue::error(
                    Some(id),
                    Some("duration_secs"),
                    "wait duration must be positive",
                ));
            }
        }
        BlockKind::If {
            variable,
            operator: _,
            value,
        } => {
            check_condition_operands(flow, id, variable, value, issues);
        }
        BlockKind::Loop {
            mode,
            stop_condition,
            ..
        } => {
            match mode {
                LoopMode::Count {
                    max_iterations,
                    count_variable,
                } => {
                    if *max_iterations == 0 && count_variable.is_none() {
                        issues.push(ValidationIssue::error(
                            Some(id),
                            Some("max_iterations"),
                            "count loop needs max_iterations or a count variable",
                        ));
                    }
                    if let Some(var) = count_variable {
                        if flow.variable(var).is_none() {
                            issues.push(ValidationIssue::error(
                                Some(id),
                                Some("count_variable"),
                                format!("variable '{var}' is not declared"),
                            ));
                        }
                    }
                }
                LoopMode::Time { budget_secs } => {
                    if *budget_secs == 0 {
                        issues.push(ValidationIssue::error(
                            Some(id),
                            Some("budget_secs"),
                            "time loop needs a positive budget",
                        ));
                    }
                }
            }
            if let Some(Condition {
                variable, value, ..
            }) = stop_condition
            {
                check_condition_operands(flow, id, variable, value, issues);
            }
        }
        BlockKind::FlowControl(kind) => match kind {
            FlowControlKind::Goto { target } => {
                if !graph.contains(target) {
                    issues.push(ValidationIssue::error(
                        Some(id),
                        Some("target"),
                        format!("goto target '{target}' does not exist"),
                    ));
                }
            }
            FlowControlKind::LoopBack { loop_id } | FlowControlKind::LoopBreak { loop_id } => {
                if let Some(owner) = loop_id {
                    match graph.block(owner).map(|b| &b.kind) {
                        Some(BlockKind::Loop { .. }) => {}
                        _ => issues.push(ValidationIssue::error(
                            Some(id),
                            Some("loop_id"),
                            format!("'{owner}' is not a loop block"),
                        )),
                    }
                }
            }
            FlowControlKind::Label => {
                let outgoing = graph.follow_connections(id, port::FLOW_OUT).len();
                if outgoing != 1 {
                    issues.push(ValidationIssue::warning(
                        Some(id),
                        format!("label should have exactly one outgoing connection, has {outgoing}"),
                    ));
                }
            }
        },
        BlockKind::Log { message, .. } => {
            require_nonempty(id, "message", message, issues);
        }
        BlockKind::Start | BlockKind::End => {}
    }
}

fn check_condition_operands(
    flow: &Flow,
    block_id: &str,
    variable: &str,
    value: &Operand,
    issues: &mut Vec<ValidationIssue>,
) {
    let left_decl = flow.variable(variable);
    if left_decl.is_none() {
        issues.push(ValidationIssue::error(
            Some(block_id),
            Some("variable"),
            format!("variable '{variable}' is not declared"),
        ));
    }
    match value {
        Operand::Literal {
            unit: Some(unit), ..
        } => {
            if let Some(var_unit) = left_decl.and_then(|d| d.unit.as_deref()) {
                if !units::compatible(unit, var_unit) {
                    issues.push(ValidationIssue::error(
                        Some(block_id),
                        Some("value"),
                        format!("cannot compare '{var_unit}' against literal in '{unit}'"),
                    ));
                }
            }
        }
        Operand::Variable { name } => {
            if flow.variable(name).is_none() {
                issues.push(ValidationIssue::error(
                    Some(block_id),
                    Some("value"),
                    format!("variable '{name}' is not declared"),
                ));
            }
        }
        Operand::Literal { unit: None, .. } => {}
    }
}

fn require_nonempty(block_id: &str, field: &str, value: &str, issues: &mut Vec<ValidationIssue>) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::error(
            Some(block_id),
            Some(field),
            format!("{field} is required"),
        ));
    }
}
