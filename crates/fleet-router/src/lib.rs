//! fleet-router — traffic routing for the fleet.
//!
//! # Components
//!
//! - **`routable`** — `RoutableSet`: in-service, healthy instances with their port mappings
//! - **`router`** — least-recently-selected round-robin over the latest set
//! - **`adapter`** — byte-transparent forwarding to the instance's application port
//! - **`sync`** — recomputes the routable set on every registry snapshot
//! - **`frontend`** — TCP listener with a bounded buffer and fast 503 failures

pub mod adapter;
pub mod frontend;
pub mod routable;
pub mod router;
pub mod sync;

pub use adapter::{AdapterError, ProxyAdapter};
pub use frontend::{SERVICE_UNAVAILABLE, TrafficFrontend};
pub use routable::{PortMapping, Routable, RoutableSet};
pub use router::{RouteError, RouteLease, Router};
pub use sync::{RouterSync, SyncStats};
