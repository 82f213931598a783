//! # relaybar-core
//!
//! Contracts shared between the menu-bar front end and the VPN session
//! controller.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **error** | `VpnError` taxonomy used across every crate |
//! | **server** | `ServerDescriptor` as produced by the server catalog |
//! | **credentials** | Tunnel credentials and the privileged-execution provider |
//! | **telemetry** | Attempt outcome recording for later server scoring |

pub mod credentials;
pub mod error;
pub mod server;
pub mod telemetry;

pub use credentials::{CredentialProvider, SudoCredentialProvider, VpnCredentials};
pub use error::VpnError;
pub use server::ServerDescriptor;
pub use telemetry::{AttemptOutcome, AttemptRecord, AttemptRecorder, MemoryRecorder, NoopRecorder};
