//! Observability for the relay service.
//!
//! # Privacy by Default
//!
//! Actor run loops use `#[instrument(skip_all)]` with explicit fields.
//! Payload contents are never logged or used as labels; only sizes and
//! message kinds.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_connections_active` | Gauge | none | Open WebSocket connections |
//! | `relay_rooms_active` | Gauge | none | Rooms in the directory |
//! | `relay_messages_relayed_total` | Counter | none | Inbound messages relayed |
//! | `relay_messages_rejected_total` | Counter | `reason` | Inbound messages dropped |
//! | `relay_admissions_rejected_total` | Counter | `reason` | Refused connections |
//! | `relay_message_latency_seconds` | Histogram | `message_type` | Receipt to handled |
//! | `relay_room_hibernations_total` | Counter | none | Idle rooms hibernated |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
