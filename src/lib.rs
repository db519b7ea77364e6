pub mod ber;
pub mod config;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;

pub use config::{Config, ServiceIdentity};
pub use handler::HandlerRegistry;
pub use server::{ClientConn, LdapFrontend};
pub use session::Session;
pub use stats::{run_stats_server, Stats};
