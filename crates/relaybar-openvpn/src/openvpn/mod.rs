//! OpenVPN module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod management;
pub mod process;
pub mod retry;
pub mod tunnel;
pub mod monitor;
pub mod logging;
pub mod backend;
pub mod service;
pub mod settings;

pub use backend::{OpenVpnBackend, VpnBackend};
pub use monitor::MonitorLease;
pub use retry::RetryPolicy;
pub use service::SessionController;
pub use settings::ControllerSettings;
pub use types::*;
