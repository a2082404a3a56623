//! Actor model implementation for the SFU controller.
//!
//! ```text
//! SfuEngine (singleton per SFU instance)
//! ├── owns SessionRegistry, Topology, pending admissions
//! └── supervises N EndpointActors
//!     └── EndpointActor (one per admitted peer)
//!         └── drives one MediaEndpoint
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner**: All session, track, and forwarding state lives in `SfuEngine`
//! - **Failure isolation**: A failing or panicking endpoint ends only its own actor
//! - **CancellationToken propagation**: Endpoints run on child tokens of the engine token
//! - **Mailbox monitoring**: Depth thresholds with metrics (Engine: 100/500, Endpoint: 50/200)
//!
//! # Modules
//!
//! - [`engine`] - `SfuEngine` singleton: signaling state machine and topology manager
//! - [`endpoint`] - `EndpointActor` per admitted peer and the `MediaEndpoint` boundary
//! - [`admission`] - Admission key issuance/validation and pending joins
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod admission;
pub mod endpoint;
pub mod engine;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use admission::{AdmissionKeyManager, PendingAdmission};
pub use endpoint::{
    EndpointActor, EndpointActorHandle, EndpointFactory, EndpointNotifier, EndpointSpec,
    MediaEndpoint, TrackDeclaration,
};
pub use engine::{EngineConfig, SfuEngine, SfuEngineHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
