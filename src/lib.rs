pub mod config;
pub mod error;
pub mod hooks;
pub mod lag;
pub mod postgres;
pub mod provisioning;
pub mod session;


pub use config::Config;
pub use error::{Error, Result};
pub use hooks::{ChangeHooks, JsonLinesHooks, LoggingHooks, NoopHooks};
pub use session::{Session, SessionHandle};
