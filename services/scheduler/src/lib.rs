//! shepherd scheduler
//!
//! Keeps the instances of every declared service converged on what the
//! service asks for. State lives in a coordination store:
//!
//! - `/services/{service}` holds the Service record
//! - `/services/{service}/{instance}` holds one Service-Instance record per
//!   placed instance
//! - `/hosts/{host}/{instance}` holds the Host-Instance record the host agent
//!   acts on
//!
//! The [`listener::ServiceListener`] runs one loop per service. Each pass
//! removes instances whose host record vanished ([`engine::Reconciler::clean`])
//! and then starts, stops, pauses or resumes instances until the set matches
//! the declaration ([`engine::Reconciler::sync`]).

pub mod api;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod listener;
pub mod lock;
pub mod paths;
pub mod records;
pub mod selector;
pub mod state;
