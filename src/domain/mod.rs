//! Domain layer public interface.
//!
//! Transport-independent abstractions used by the client. All consumers
//! import these through this module rather than the individual files.

mod transport;

pub use transport::{
    //
    Address,
    Credential,
    Endpoint,
    Link,
    Transport,
    TransportPtr,
};
