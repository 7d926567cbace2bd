pub(crate) mod frame;

mod connection;
pub(crate) use connection::{NegotiationOptions, Negotiator, Outcome, RawConnection};
pub use connection::Flavor;
