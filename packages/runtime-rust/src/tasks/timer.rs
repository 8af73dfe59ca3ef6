//! Periodic cooperative tasks.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use super::handle::TaskHandle;
use super::supervisor::{boxed_task, TaskError, TaskSupervisor};

/// Schedule of a timer task.
///
/// A periodic timer with `autostart` ticks immediately and then every
/// `interval`; without it, the first tick comes after one interval. A
/// `one_shot` timer always waits one interval and ticks once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub interval: Duration,
    pub one_shot: bool,
    pub autostart: bool,
}

impl TimerSpec {
    /// Periodic timer, first tick after one interval.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            one_shot: false,
            autostart: false,
        }
    }

    /// Single tick after `delay`.
    #[must_use]
    pub fn once_after(delay: Duration) -> Self {
        Self {
            interval: delay,
            one_shot: true,
            autostart: false,
        }
    }

    #[must_use]
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

impl Default for TimerSpec {
    fn default() -> Self {
        Self::every(Duration::from_secs(1))
    }
}

/// Drives `tick` per `spec`. A failing tick ends the timer.
async fn run_timer<F, Fut>(name: String, spec: TimerSpec, mut tick: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut tick_now = spec.autostart && !spec.one_shot;
    loop {
        if tick_now {
            debug!(name = %name, "timer tick");
            tick()
                .await
                .with_context(|| format!("timer {name} failed and will not recover"))?;
            if spec.one_shot {
                return Ok(());
            }
        }
        tick_now = true;
        tokio::time::sleep(spec.interval).await;
    }
}

impl TaskSupervisor {
    /// Registers a timer to be launched by [`start_all`](Self::start_all).
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is in use.
    pub fn register_timer<F, Fut>(
        &self,
        name: impl Into<String>,
        spec: TimerSpec,
        tick: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let timer_name = name.clone();
        self.register_boxed_task(name, boxed_task(move |_| run_timer(timer_name, spec, tick)))
    }

    /// Starts a timer now.
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is in use.
    pub fn start_timer<F, Fut>(
        &self,
        name: impl Into<String>,
        spec: TimerSpec,
        tick: F,
    ) -> Result<TaskHandle, TaskError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let timer_name = name.clone();
        self.start_boxed_task(name, boxed_task(move |_| run_timer(timer_name, spec, tick)))
    }
}
