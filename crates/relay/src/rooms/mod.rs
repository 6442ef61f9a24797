pub mod dispatcher;
pub mod registry;

pub use dispatcher::{DeliveryReport, NotificationDispatcher, NotifyError};
pub use registry::{ConnectionHandle, ConnectionId, DeliveryError, OutboundFrame, RoomRegistry};
