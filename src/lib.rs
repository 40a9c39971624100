pub mod cli;
pub mod command;
pub mod config;
pub mod guard;
pub mod protocol;
pub mod robot;

pub use cli::prompt;
pub use command::{Command, CommandError};
pub use config::{ConfigError, LinkConfig};
pub use guard::ProximityGuard;
pub use protocol::{ConnectionManager, ConnectionState, Frame, LinkError, TcpConnector};
pub use robot::RobotCommand;
