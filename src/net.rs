pub mod body;
pub(crate) mod fetch;
pub mod request;
pub mod response;

pub use body::{negotiate, ByteSource, ByteStream, Negotiated, Payload, WireFormat};
pub use request::RequestSpec;
pub use response::{BodyStream, RawResponse};
pub use reqwest::dns::{Addrs, Name, Resolve, Resolving};
