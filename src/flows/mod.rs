pub mod events;
pub mod graph;
pub mod interpreter;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationStrategy;
use crate::devices::ActuatorAction;

/// Named ports on a block. Connections reference ports by name, never by
/// position.
pub mod port {
    pub const FLOW_OUT: &str = "flowOut";
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const BODY: &str = "body";
    pub const EXIT: &str = "exit";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(flatten)]
    pub kind: BlockKind,
    /// Editor canvas position. Execution ignores it.
    #[serde(default)]
    pub position: Position,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Start,
    End,
    SensorRead {
        device_id: String,
        variable: String,
        #[serde(default)]
        strategy: CalibrationStrategy,
    },
    ActuatorSet {
        device_id: String,
        action: ActuatorAction,
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        duration_secs: Option<u64>,
        #[serde(default)]
        power_level: Option<u8>,
    },
    Wait {
        duration_secs: u64,
    },
    If {
        variable: String,
        operator: CompareOp,
        value: Operand,
    },
    Loop {
        mode: LoopMode,
        #[serde(default)]
        stop_condition: Option<Condition>,
        #[serde(default)]
        delay_secs: u64,
    },
    FlowControl(FlowControlKind),
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Start => "start",
            BlockKind::End => "end",
            BlockKind::SensorRead { .. } => "sensor_read",
            BlockKind::ActuatorSet { .. } => "actuator_set",
            BlockKind::Wait { .. } => "wait",
            BlockKind::If { .. } => "if",
            BlockKind::Loop { .. } => "loop",
            BlockKind::FlowControl(_) => "flow_control",
            BlockKind::Log { .. } => "log",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum FlowControlKind {
    /// Pure passthrough with a single outgoing port, used as a jump target.
    Label,
    /// Transfer the cursor directly to `target`; no graph edge required.
    Goto { target: String },
    /// Re-enter the owning loop's head block.
    LoopBack {
        #[serde(default)]
        loop_id: Option<String>,
    },
    /// Leave through the owning loop's exit port.
    LoopBreak {
        #[serde(default)]
        loop_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoopMode {
    Count {
        max_iterations: u32,
        /// When set, the live value of this variable overrides
        /// `max_iterations`.
        #[serde(default)]
        count_variable: Option<String>,
    },
    Time {
        budget_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub operator: CompareOp,
    pub value: Operand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Operand {
    Literal {
        value: f64,
        #[serde(default)]
        unit: Option<String>,
    },
    Variable {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn eval(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Lt => left < right,
            CompareOp::Ge => left >= right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source_block: String,
    pub source_port: String,
    pub target_block: String,
    pub target_port: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Local,
    Global,
}

/// Variable declaration carried by the flow. The unit is fixed here and
/// never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scope: VariableScope,
}

/// Convenience constructors used by tests and the simulated wiring.
impl Flow {
    pub fn new(id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            blocks: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_block(mut self, id: &str, kind: BlockKind) -> Self {
        self.blocks.push(Block {
            id: id.to_string(),
            kind,
            position: Position::default(),
        });
        self
    }

    pub fn with_connection(mut self, source: &str, port: &str, target: &str) -> Self {
        self.connections.push(Connection {
            source_block: source.to_string(),
            source_port: port.to_string(),
            target_block: target.to_string(),
            target_port: "flowIn".to_string(),
        });
        self
    }

    pub fn with_variable(mut self, name: &str, unit: Option<&str>) -> Self {
        self.variables.push(VariableDecl {
            name: name.to_string(),
            unit: unit.map(String::from),
            scope: VariableScope::Local,
        });
        self
    }

    /// Minimal valid flow: START → END.
    pub fn linear(id: &str, name: &str) -> Self {
        Self::new(id, name)
            .with_block("start", BlockKind::Start)
            .with_block("end", BlockKind::End)
            .with_connection("start", port::FLOW_OUT, "end")
    }
}
