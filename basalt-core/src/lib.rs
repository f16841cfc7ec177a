pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod policy;
pub mod types;

pub use config::*;
pub use context::*;
pub use error::*;
pub use notify::*;
pub use policy::*;
pub use types::*;
