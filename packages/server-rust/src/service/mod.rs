//! The request pipeline and the envelope that owns its shared state.
//!
//! 1. **Classification** (`classify`): operation name -> SLO tier
//! 2. **Middleware** (`middleware`): Tower layers, one per pipeline stage
//! 3. **Envelope** (`envelope`): shared primitives, pipeline assembly and
//!    protected dependency calls
//! 4. **Operation types** (`operation`): request context, reply and failure

pub mod classify;
pub mod envelope;
pub mod middleware;
pub mod operation;

pub use classify::{normalize_operation, SloClassifier};
pub use envelope::Envelope;
pub use middleware::{build_pipeline, Pipeline};
pub use operation::{Failure, Reply, Request, RequestContext};
