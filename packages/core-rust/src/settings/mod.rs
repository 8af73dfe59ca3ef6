//! Hierarchical configuration data: dotted keys, values and the in-memory tree.

pub mod key;
pub mod tree;
pub mod value;

pub use key::SettingKey;
pub use tree::SettingsTree;
pub use value::{ConvertError, SettingValue};
