//! Runtime adapters, batch dispatch and API surface.

pub mod api;
pub mod dispatcher;
pub mod tokio_spawner;

pub use api::{batch_templates, BatchCreateRequest, BatchResponse, BatchStatusResponse, BatchTemplate};
pub use dispatcher::{BatchDispatcher, DispatchOutcome};
pub use tokio_spawner::TokioSpawner;
