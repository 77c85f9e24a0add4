//! # kiln-server
//!
//! HTTP control plane for kiln development sandboxes.
//!
//! ## Quick Start
//!
//! Run the server against a host prepared for Firecracker:
//!
//! ```bash
//! cargo run -p kiln-server
//! ```
//!
//! Without KVM, LVM or a reverse proxy, run in synthetic mode. Records go
//! through the full bookkeeping but no VM is started:
//!
//! ```bash
//! export KILN_MODE=synthetic
//! export KILN_WORKSPACES=./workspaces.json
//! cargo run -p kiln-server
//! ```
//!
//! ## Endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /health` | Health check |
//! | `GET /sandboxes` | List sandboxes |
//! | `POST /sandboxes` | Build a sandbox, `?async=true` to queue it |
//! | `GET /sandboxes/:id` | Sandbox record |
//! | `DELETE /sandboxes/:id` | Destroy a sandbox |
//! | `GET /jobs/:id` | Queued build |
//! | `DELETE /jobs/:id` | Cancel a queued build |
//! | `GET /queue` | Queue statistics |
//! | `POST /workspaces/:id/prebuild` | Start a prebuild |
//! | `DELETE /workspaces/:id/prebuild` | Delete a prebuild |

pub mod config;
pub mod http;

pub use config::{ConfigError, KilnConfig};
pub use http::{build_router, serve, ApiError, AppState};
