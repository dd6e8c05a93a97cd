//! Lead scoring, qualification and outreach sequence automation.
//!
//! Leads are scored by the [`scoring::ScoringEngine`] and qualified by the
//! [`qualification::QualificationService`]. Qualified leads move through
//! multi-step outreach sequences driven by the [`automation::SequenceEngine`];
//! the [`dispatcher::DeliveryDispatcher`] delivers the resulting work items and
//! the [`scheduler::Scheduler`] runs both on a fixed interval.

pub mod automation;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fixtures;
pub mod lead;
pub mod qualification;
pub mod queue;
pub mod render;
pub mod scheduler;
pub mod scoring;
pub mod sequence;
pub mod store;
pub mod transport;

pub use error::{LeadflowError, Result};
