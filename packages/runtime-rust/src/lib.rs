//! Hearth Runtime: resource lifecycle, layered settings with live updates,
//! and supervision of background tasks and threads.

pub mod config;
pub mod context;
pub mod lifecycle;
pub mod settings;
pub mod tasks;
pub mod telemetry;

pub use config::{LogFormat, RuntimeArgs, RuntimeConfig};
pub use context::ServiceContext;
pub use lifecycle::{
    run_service, LifecycleCoordinator, LifecycleError, Resource, ResourceCell, ResourceState,
    ServiceDescriptor, ShutdownController, StatusMonitor,
};
pub use settings::{
    FileBackend, MemoryBackend, SettingsBackend, SettingsError, SettingsStore, SettingsView,
};
pub use tasks::{TaskHandle, TaskKind, TaskOutcome, TaskSupervisor, TimerSpec};
