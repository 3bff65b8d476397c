pub mod dispatcher;
pub mod invalidation;
pub mod models;

pub use dispatcher::{BlockNotice, DispatchError, DispatchReport, DispatchStats, InvalidationDispatcher};
pub use invalidation::{patterns_for, templates_for, PatternTemplate};
pub use models::{DomainEvent, EventTag};
