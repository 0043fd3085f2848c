use crate::agent::{ActionExecutor, Agent, AgentEvent, RunContext, RunError, RunReport, RunStatus};
use crate::llm::{ConfigurationError, ModelClient, Provider, ProviderConfig, ProviderKind};
use crate::screen::PixelSource;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ========================= Provider Config =========================

/// Where the active provider comes from. Consulted once per submitted task.
pub trait ProviderConfigStore: Send + Sync {
    fn active_provider(&self) -> Result<ProviderConfig, ConfigurationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EnvConfigStore;

impl ProviderConfigStore for EnvConfigStore {
    fn active_provider(&self) -> Result<ProviderConfig, ConfigurationError> {
        ProviderConfig::from_env()
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    current: RwLock<Option<ProviderConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, provider: &str, api_key: &str) -> Result<ProviderKind, ConfigurationError> {
        let kind: ProviderKind = provider.parse()?;
        if api_key.trim().is_empty() {
            return Err(ConfigurationError::MissingKey(kind));
        }
        self.set_config(ProviderConfig::new(kind, api_key.trim()));
        Ok(kind)
    }

    pub fn set_config(&self, cfg: ProviderConfig) {
        info!(provider = %cfg.kind, model = %cfg.model, "provider configured");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(cfg);
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl ProviderConfigStore for MemoryConfigStore {
    fn active_provider(&self) -> Result<ProviderConfig, ConfigurationError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConfigurationError::NoProvider)
    }
}

// ========================= Task Controller =========================

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("a task is already running: {0}")]
    Busy(String),
    #[error("task text is empty")]
    EmptyTask,
}

impl From<RunError> for SubmitError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Busy(task) => SubmitError::Busy(task),
        }
    }
}

/// Front door for a UI or transport. Runs submitted tasks in the background,
/// one at a time.
pub struct TaskController<E, S> {
    agent: Arc<tokio::sync::Mutex<Agent<E, S>>>,
    ctx: Arc<RunContext>,
    store: Arc<dyn ProviderConfigStore>,
    handle: Mutex<Option<JoinHandle<RunReport>>>,
}

impl<E, S> TaskController<E, S>
where
    E: ActionExecutor + 'static,
    S: PixelSource + 'static,
{
    pub fn new(agent: Agent<E, S>, store: Arc<dyn ProviderConfigStore>) -> Self {
        let ctx = agent.context();
        Self {
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
            ctx,
            store,
            handle: Mutex::new(None),
        }
    }

    pub fn submit_task(&self, task: &str) -> Result<(), SubmitError> {
        if task.trim().is_empty() {
            return Err(SubmitError::EmptyTask);
        }
        if self.ctx.status().is_running {
            return Err(SubmitError::Busy(self.ctx.status().current_task.unwrap_or_default()));
        }
        let cfg = self.store.active_provider()?;
        let provider = Provider::from_config(cfg)?;
        info!(provider = %provider.kind(), model = provider.model(), "task accepted");
        self.submit_with(task, provider)
    }

    pub fn submit_with<M>(&self, task: &str, client: M) -> Result<(), SubmitError>
    where
        M: ModelClient + 'static,
    {
        if task.trim().is_empty() {
            return Err(SubmitError::EmptyTask);
        }
        let guard = self.ctx.begin(task.trim())?;
        let agent = Arc::clone(&self.agent);
        let handle = tokio::spawn(async move {
            let mut agent = agent.lock().await;
            agent.drive(guard, &client).await
        });
        let previous = self.handle.lock().unwrap_or_else(PoisonError::into_inner).replace(handle);
        if let Some(previous) = previous {
            if !previous.is_finished() {
                warn!("previous run still winding down");
            }
        }
        Ok(())
    }

    pub fn request_stop(&self) -> bool {
        self.ctx.request_stop()
    }

    pub fn status(&self) -> RunStatus {
        self.ctx.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.ctx.subscribe()
    }

    pub async fn wait(&self) -> Option<RunReport> {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("run task did not complete: {}", e);
                None
            }
        }
    }
}
