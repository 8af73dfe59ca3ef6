//! Layered configuration: backends, the caching store, scoped views, promised
//! settings and watch loops.

pub mod backend;
mod error;
pub mod file;
pub mod memory;
mod promised;
mod store;
mod view;
pub mod watch;

pub use backend::{SettingsBackend, WatchEvent, WatchStream};
pub use error::{BackendError, SettingsError};
pub use file::{FileBackend, FileFormat};
pub use memory::MemoryBackend;
pub use promised::PromisedSetting;
pub use store::SettingsStore;
pub use view::SettingsView;
pub use watch::{watch_callback, WatchCallback};
