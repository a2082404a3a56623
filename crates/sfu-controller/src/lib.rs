//! SFU Controller Library
//!
//! The control plane of a Selective Forwarding Unit: it admits peers into a single
//! conference and decides which media tracks flow from which publishing peer to which
//! receiving peer. Media bytes never pass through this crate; each admitted peer is
//! backed by a `MediaEndpoint` that does the actual forwarding.
//!
//! # Architecture
//!
//! ```text
//! Signaling Codec ──events──▶ SfuEngine ◀──notifications── EndpointActor (per peer)
//!        ▲                     │   │                              │
//!        └───outbound events───┘   └──commands────────────────────┘
//!                              │
//!                              └──publish──▶ NotificationDispatcher ──▶ Admission Authority
//! ```
//!
//! # Key Design Decisions
//!
//! - **Non-blocking admission**: joins wait in a pending table; the engine keeps serving
//!   other peers while the admission authority decides
//! - **Reconciled forwarding**: the edge set is recomputed from registry state after
//!   every change, so repeated events never duplicate edges
//! - **Failure isolation**: each endpoint runs in its own task; a failure removes only
//!   that peer
//!
//! # Modules
//!
//! - [`actors`] - Engine and endpoint actors, admission keys
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types
//! - [`notifications`] - Topic-based notification dispatcher
//! - [`observability`] - Tracing, metrics, health probes
//! - [`registry`] - Sessions, tracks, endpoint children
//! - [`service`] - Bootstrap
//! - [`signaling`] - Decoded signaling events and the codec boundary
//! - [`topology`] - Forwarding edges
//! - [`types`] - Identifiers and value types

pub mod actors;
pub mod config;
pub mod errors;
pub mod notifications;
pub mod observability;
pub mod registry;
pub mod service;
pub mod signaling;
pub mod topology;
pub mod types;

pub use config::{Config, WithdrawalExclusion};
pub use errors::{AdmissionKeyError, SfuError};
pub use service::SfuService;
