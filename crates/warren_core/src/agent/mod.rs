//! Agent classes, instances, connections and handlers.

pub mod class;
pub mod connection;
pub mod handler;
pub mod instance;

pub use class::{AgentClass, AgentClassBuilder};
pub use connection::{Connection, ReadyState, SocketCommand, CLOSE_INTERNAL_ERROR};
pub use handler::{
    AgentHandler, AgentRequest, AgentResponse, ChatBodyStream, EmailMessage, StateSource,
};
pub use instance::Agent;
