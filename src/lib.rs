pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod pricing;

pub use amount::{Amount, Quantity};
pub use config::Config;
pub use engine::{Command, Engine, EngineError, EngineHandle, ErrorKind, Outcome};
pub use lifecycle::OrderStatus;
pub use model::{Actor, Context, OrderId, Role, UserId};
