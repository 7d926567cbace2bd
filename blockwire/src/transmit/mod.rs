pub(crate) mod frame;

mod connection;
pub(crate) use connection::{Completion, IoConnection};
pub(crate) use frame::IoKind;
