//! # aquadopp-core
//!
//! Protocol engine for the Nortek Aquadopp.
//!
//! This crate provides:
//! - The parameter dictionary and the Aquadopp device profile
//! - The connection state machine
//! - The protocol engine driving one instrument over a byte link
//! - A driver task with a cloneable host handle
//! - Event broadcasting and configuration

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod fsm;
pub mod link;
pub mod param;
pub mod profile;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, LinkConfig, ProtocolConfig};
pub use driver::{Driver, DriverHandle};
pub use engine::{InstrumentProtocol, Operation, Outcome};
pub use error::{DriverError, ErrorKind};
pub use event::{DriverEvent, EventBroadcaster};
pub use fsm::{Action, ConnectionState, ProtocolEvent, TransitionTable};
pub use link::{Connector, TcpConnector};
pub use param::{
    Block, Domain, Locator, Mutability, ParameterDescriptor, ParameterDictionary, PendingWrite,
};
pub use profile::{DeviceProfile, TranslateFn};
