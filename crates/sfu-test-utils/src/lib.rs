//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU controller.
//!
//! ## Modules
//!
//! - `conference` - Started SFU with an accepting authority, plus edge-set helpers
//! - `mock_endpoint` - Recording Media Endpoint factory with failure injection
//! - `mock_authority` - Scripted admission authority subscribed to `new_peer`
//! - `fixtures` - Config, admission keys, join events, tracing setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let factory = MockEndpointFactory::new();
//!     let (service, mut outbound) = start_service(factory.clone());
//!     let authority = MockAuthority::accept_all(service.dispatcher(), service.handle());
//!
//!     let key = service.issue_admission_key().unwrap();
//!     service
//!         .handle()
//!         .signaling(JoinBuilder::new(&key, "alice").publishes_audio().build())
//!         .await
//!         .unwrap();
//!
//!     // ...
//!     authority.stop();
//! }
//! ```

pub mod conference;
pub mod fixtures;
pub mod mock_authority;
pub mod mock_endpoint;

// Re-export commonly used items
pub use conference::*;
pub use fixtures::*;
pub use mock_authority::*;
pub use mock_endpoint::*;
