#![warn(missing_docs)]

//! streamlink server: hosts consensus groups, bridge links and replication in one process

pub mod config;
pub mod error;
pub mod meta;
pub mod server;
pub mod status;

pub use config::Config;
pub use error::ServerError;
pub use meta::{MetaChange, MetaCommand, MetaState, StreamAssignment};
pub use server::{Collaborators, Server};
pub use status::{RemoteStatus, ServerStatus};
