pub use app_error::{AppError, AppResult};
pub use config::{NetworkConfig, StoneWireConfig, ENV_PREFIX};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
