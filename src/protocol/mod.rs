pub mod inbound;
pub mod outbound;

pub use inbound::{ClientEvent, EventKind};
pub use outbound::ServerEvent;
