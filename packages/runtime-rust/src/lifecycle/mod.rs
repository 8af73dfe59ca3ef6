//! Service lifecycle: resource contract, start ordering, shutdown trigger,
//! signal handling and status supervision.

mod coordinator;
mod informer;
mod resource;
mod shutdown;
mod signals;
mod status_monitor;
mod watchdog;

pub use coordinator::{
    run_service, serve, LifecycleCoordinator, LifecycleError, EXIT_BIND_FAILURE,
    EXIT_STARTUP_FAILURE, EXIT_UNSOLVABLE_DEPENDENCIES,
};
pub use informer::{EnvironmentInfo, NOT_IN_CONTAINER};
pub use resource::{Resource, ResourceCell, ResourceEntry, ResourceState, ServiceDescriptor};
pub use shutdown::{ServiceState, ShutdownController};
pub use signals::{SignalListener, SignalRegistry, SIGHUP, SIGINT, SIGQUIT, SIGTERM};
pub use status_monitor::{
    Enforcement, ResourceSelection, RestartPolicy, StatusMonitor, RESTART_ON_FAILURE_KEY,
    SHUTDOWN_ON_FAILURE_KEY,
};
pub use watchdog::{process_exit_hook, ExitHook, GraceWatchdog};
