pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod hub_transport;
pub mod transport;
pub mod view;

pub use backoff::Backoff;
pub use config::{ClientConfig, HubTransportConfig};
pub use coordinator::{EditFailure, EntityStatus, FieldState, SyncHandle};
pub use hub_transport::HubTransport;
pub use transport::{Ack, LocalTransport, Transport, TransportEvent};
pub use view::LocalView;
