//! gRPC admission control: identity extraction, rejection formatting and
//! the call gate wrapping unary handlers.

mod formatter;
mod gate;
mod identity;

pub use formatter::{DefaultViolationFormatter, ViolationFormatter};
pub use gate::{internal_status, Admission, CallGate, CallGateBuilder};
pub use identity::{
    CallContext, FieldTag, FieldTagAttributes, IdentityProvider, MetadataIdentity, Payload,
    PeerIdentity, StaticIdentity, ANONYMOUS,
};
