//! Domain layer public interface.
//!
//! This module defines the message model and the broker capability
//! interface. Nothing here depends on a concrete broker, wire protocol,
//! or client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod message;

// --- Domain re-exports ---

pub use broker::{
    //
    Broker,
    BrokerPtr,
};

pub use message::{
    //
    Ack,
    Message,
    Record,
    Topic,
    MESSAGE_ID_HEADER,
};
