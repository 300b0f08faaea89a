pub mod schema;

#[allow(unused_imports)]
pub use schema::{Config, DirectoryConfig, DispatchConfig, MessagingConfig, ServerConfig};
