pub mod action;
pub mod agent;
pub mod anthropic;
pub mod browser;
pub mod cache;
pub mod gemini;
pub mod llm;
pub mod openai;
pub mod screen;
pub mod session;

pub use agent::{Agent, AgentConfig, AgentEvent, EventKind, RunOutcome, RunReport, RunState, RunStatus};
pub use browser::{BrowserDesktop, BrowserDesktopConfig};
pub use cache::{CacheConfig, ScreenshotCache};
pub use llm::{ModelClient, Provider, ProviderConfig, ProviderKind};
pub use screen::{CaptureFrame, PixelSource};
pub use session::{EnvConfigStore, MemoryConfigStore, TaskController};
