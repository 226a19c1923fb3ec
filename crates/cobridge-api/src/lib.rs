// cobridge-api: CoAP message model, transport seams, and the cloud
// registration wire client.

pub mod cloud;
pub mod codec;
pub mod error;
pub mod link;
pub mod message;
pub mod transport;
pub mod udp;

pub use error::Error;
pub use link::{LinkPolicy, ResourceLink};
pub use message::{Code, ContentFormat, Method, Request, Response};
pub use transport::{Connection, Dialer, NotificationSink, Peer, RequestHandler};
