//! Persistence seam. Pure CRUD: no business rules live here, the scheduler
//! owns every state transition and only asks the store to remember it.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::flows::Flow;
use crate::scheduler::queue::QueueItem;
use crate::scheduler::{ActiveProgram, Program};

#[async_trait]
pub trait Store: Send + Sync {
    // Flows
    async fn list_flows(&self) -> Vec<Flow>;
    async fn get_flow(&self, id: &str) -> Option<Flow>;
    async fn save_flow(&self, flow: Flow) -> Result<()>;

    // Program templates
    async fn get_program(&self, id: &str) -> Option<Program>;
    async fn save_program(&self, program: Program) -> Result<()>;

    // The singleton active program
    async fn load_active_program(&self) -> Option<ActiveProgram>;
    async fn save_active_program(&self, program: &ActiveProgram) -> Result<()>;
    async fn clear_active_program(&self) -> Result<()>;

    // Execution queue
    async fn load_queue(&self) -> Vec<QueueItem>;
    async fn save_queue(&self, items: &[QueueItem]) -> Result<()>;

    // Lifecycle
    async fn load_all(&self) -> Result<()>;
}

/// JSON files under a base directory, mirrored in memory.
pub struct FileStore {
    base_dir: PathBuf,
    flows: RwLock<HashMap<String, Flow>>,
    programs: RwLock<HashMap<String, Program>>,
    active: RwLock<Option<ActiveProgram>>,
    queue: RwLock<Vec<QueueItem>>,
}

impl FileStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            flows: RwLock::new(HashMap::new()),
            programs: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            queue: RwLock::new(Vec::new()),
        }
    }

    fn flows_dir(&self) -> PathBuf {
        self.base_dir.join("flows")
    }

    fn programs_dir(&self) -> PathBuf {
        self.base_dir.join("programs")
    }

    fn active_program_file(&self) -> PathBuf {
        self.base_dir.join("active_program.json")
    }

    fn queue_file(&self) -> PathBuf {
        self.base_dir.join("queue.json")
    }

    fn write_json<T: serde::Serialize>(&self, path: &PathBuf, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(value).context("failed to serialize")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write: {}", path.display()))?;
        Ok(())
    }

    fn load_dir<T: serde::de::DeserializeOwned>(dir: &PathBuf) -> Result<Vec<T>> {
        let mut values = Vec::new();
        if !dir.exists() {
            return Ok(values);
        }
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read dir: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read: {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(value) => values.push(value),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn list_flows(&self) -> Vec<Flow> {
        self.flows.read().await.values().cloned().collect()
    }

    async fn get_flow(&self, id: &str) -> Option<Flow> {
        self.flows.read().await.get(id).cloned()
    }

    async fn save_flow(&self, flow: Flow) -> Result<()> {
        self.write_json(&self.flows_dir().join(format!("{}.json", flow.id)), &flow)?;
        self.flows.write().await.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn get_program(&self, id: &str) -> Option<Program> {
        self.programs.read().await.get(id).cloned()
    }

    async fn save_program(&self, program: Program) -> Result<()> {
        self.write_json(
            &self.programs_dir().join(format!("{}.json", program.id)),
            &program,
        )?;
        self.programs
            .write()
            .await
            .insert(program.id.clone(), program);
        Ok(())
    }

    async fn load_active_program(&self) -> Option<ActiveProgram> {
        self.active.read().await.clone()
    }

    async fn save_active_program(&self, program: &ActiveProgram) -> Result<()> {
        self.write_json(&self.active_program_file(), program)?;
        *self.active.write().await = Some(program.clone());
        Ok(())
    }

    async fn clear_active_program(&self) -> Result<()> {
        let path = self.active_program_file();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete: {}", path.display()))?;
        }
        *self.active.write().await = None;
        Ok(())
    }

    async fn load_queue(&self) -> Vec<QueueItem> {
        self.queue.read().await.clone()
    }

    async fn save_queue(&self, items: &[QueueItem]) -> Result<()> {
        self.write_json(&self.queue_file(), &items.to_vec())?;
        *self.queue.write().await = items.to_vec();
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let flows: Vec<Flow> = Self::load_dir(&self.flows_dir())?;
        let programs: Vec<Program> = Self::load_dir(&self.programs_dir())?;

        let mut flow_map = self.flows.write().await;
        for flow in flows {
            flow_map.insert(flow.id.clone(), flow);
        }
        drop(flow_map);

        let mut program_map = self.programs.write().await;
        for program in programs {
            program_map.insert(program.id.clone(), program);
        }
        drop(program_map);

        let active_path = self.active_program_file();
        if active_path.exists() {
            let content = std::fs::read_to_string(&active_path)
                .with_context(|| format!("failed to read: {}", active_path.display()))?;
            *self.active.write().await = serde_json::from_str(&content).ok();
        }

        let queue_path = self.queue_file();
        if queue_path.exists() {
            let content = std::fs::read_to_string(&queue_path)
                .with_context(|| format!("failed to read: {}", queue_path.display()))?;
            *self.queue.write().await = serde_json::from_str(&content).unwrap_or_default();
        }

        let flow_count = self.flows.read().await.len();
        let program_count = self.programs.read().await.len();
        tracing::info!(
            flows = flow_count,
            programs = program_count,
            "store loaded"
        );
        Ok(())
    }
}

/// Volatile store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<HashMap<String, Flow>>,
    programs: RwLock<HashMap<String, Program>>,
    active: RwLock<Option<ActiveProgram>>,
    queue: RwLock<Vec<QueueItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_flows(&self) -> Vec<Flow> {
        self.flows.read().await.values().cloned().collect()
    }

    async fn get_flow(&self, id: &str) -> Option<Flow> {
        self.flows.read().await.get(id).cloned()
    }

    async fn save_flow(&self, flow: Flow) -> Result<()> {
        self.flows.write().await.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn get_program(&self, id: &str) -> Option<Program> {
        self.programs.read().await.get(id).cloned()
    }

    async fn save_program(&self, program: Program) -> Result<()> {
        self.programs
            .write()
            .await
            .insert(program.id.clone(), program);
        Ok(())
    }

    async fn load_active_program(&self) -> Option<ActiveProgram> {
        self.active.read().await.clone()
    }

    async fn save_active_program(&self, program: &ActiveProgram) -> Result<()> {
        *self.active.write().await = Some(program.clone());
        Ok(())
    }

    async fn clear_active_program(&self) -> Result<()> {
        *self.active.write().await = None;
        Ok(())
    }

    async fn load_queue(&self) -> Vec<QueueItem> {
        self.queue.read().await.clone()
    }

    async fn save_queue(&self, items: &[QueueItem]) -> Result<()> {
        *self.queue.write().await = items.to_vec();
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        Ok(())
    }
}
