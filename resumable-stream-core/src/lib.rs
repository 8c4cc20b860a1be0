pub mod config;
pub mod error;
pub mod keys;
pub mod local;
pub mod logging;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use keys::KeyBuilder;
pub use local::LocalTransport;
pub use transport::{Publisher, Subscriber, Subscription};
