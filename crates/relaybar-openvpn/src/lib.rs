//! # relaybar-openvpn
//!
//! Drives one external OpenVPN client through its whole lifecycle.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Connection state, parsed control responses, statistics, sessions |
//! | **config** | Client config generation from a relay's embedded blob |
//! | **management** | Unix management-socket client and response parser |
//! | **process** | Privileged launch, process-table queries, termination |
//! | **retry** | Capped exponential backoff with cooperative cancellation |
//! | **tunnel** | Byte-counter deltas and statistics snapshots |
//! | **monitor** | Lease-counted statistics polling loop |
//! | **logging** | Client log tail diagnosis |
//! | **backend** | `VpnBackend` capability trait and the OpenVPN backend |
//! | **service** | `SessionController`, the single owner of connection state |
//! | **settings** | Controller settings persisted as JSON |

pub mod openvpn;
