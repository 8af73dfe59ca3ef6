//! Identity utilities shared by the runtime: forward references, interned
//! handles, and the counter meter.

pub mod flyweight;
pub mod meter;
pub mod promise;

pub use flyweight::{FlyweightKey, FlyweightRegistry};
pub use meter::Counter;
pub use promise::{Promise, PromiseError};
