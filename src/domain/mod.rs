//! Domain layer: entities, the Store port, money, and the error taxonomy.
//!
//! Nothing in this module depends on sqlx, axum, or any other adapter
//! concern — it is the layer everything else builds against.

pub mod error;
pub mod models;
pub mod money;
pub mod ports;

pub use error::{OpsError, OpsResult, StoreError, StoreResult};
pub use money::Usd;
