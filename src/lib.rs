pub mod error;
pub mod events;
pub mod schema;
pub mod normalizer;

pub mod queue;
pub mod source;
pub mod pipeline;

pub mod frame;
pub mod sse;
pub mod ndjson;
pub mod passthrough;

pub mod session;
pub mod registry;
pub mod provider;
pub mod state;
pub mod handlers;
pub mod init;

pub use crate::events::{Event, SourceError};
pub use crate::schema::{NormalizedEvent, SCHEMA_VERSION};
pub use crate::session::{StreamMode, StreamSession, Transport};
pub use crate::state::{AppState, StreamSettings};
