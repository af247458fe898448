mod dsn;
mod options;
mod settings;

pub use dsn::{resolve, supports, ConnectionConfig, Endpoint, HostPort};
pub use options::{ConnectionOptions, Credentials, TransportOptions, WireFormat, KNOWN_OPTIONS};
pub use settings::{LogFormat, LogSettings, Settings, TransportSettings, WorkerSettings};
