pub mod audit;
pub mod backup;
pub mod config;
pub mod error;
pub mod evidence;
pub mod playbooks;
pub mod probe;
pub mod redact;
pub mod remote;
pub mod signature;
pub mod store;

pub use error::{Error, Result};
