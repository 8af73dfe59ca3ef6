//! Long-lived watch loops feeding backend change notifications to callbacks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use hearth_core::{SettingKey, SettingValue};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{SettingsBackend, WatchEvent, WatchStream};
use super::BackendError;

/// Callback invoked with the changed key and its new value (`None` on delete).
pub type WatchCallback =
    Arc<dyn Fn(SettingKey, Option<SettingValue>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`WatchCallback`].
pub fn watch_callback<F, Fut>(callback: F) -> WatchCallback
where
    F: Fn(SettingKey, Option<SettingValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |key, value| callback(key, value).boxed())
}

/// Ordered callbacks shared between a store and the loop serving them.
pub(crate) type CallbackList = Arc<RwLock<Vec<WatchCallback>>>;

/// Runs until `cancel` fires, starting from `initial`, the subscription taken
/// before the loop was spawned. Stream errors and stream ends are treated as
/// transient: the loop waits `backoff` and subscribes again.
pub(crate) async fn run_watch_loop(
    backend: Arc<dyn SettingsBackend>,
    key: SettingKey,
    initial: Result<WatchStream, BackendError>,
    callbacks: CallbackList,
    cancel: CancellationToken,
    backoff: Duration,
) {
    debug!(key = %key, backend = backend.name(), "watch loop started");
    let mut pending = Some(initial);
    loop {
        let subscription = match pending.take() {
            Some(subscription) => subscription,
            None => tokio::select! {
                () = cancel.cancelled() => break,
                subscription = backend.watch(&key) => subscription,
            },
        };

        let error = match subscription {
            Ok(mut events) => loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(key = %key, "watch loop cancelled");
                        return;
                    }
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) => dispatch(&key, &callbacks, event).await,
                    Some(Err(error)) => break error,
                    None => break BackendError::Closed,
                }
            },
            Err(error) => error,
        };

        warn!(
            key = %key,
            error = %error,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "settings watch interrupted, retrying"
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
    }
    debug!(key = %key, "watch loop cancelled");
}

async fn dispatch(watched: &SettingKey, callbacks: &CallbackList, event: WatchEvent) {
    if event.is_noop() {
        debug!(key = %watched, changed = %event.key, "ignoring notification without change");
        return;
    }
    let snapshot: Vec<WatchCallback> = callbacks.read().clone();
    for callback in snapshot {
        callback(event.key.clone(), event.value.clone()).await;
    }
}
