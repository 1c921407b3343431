//! Emergency broadcast coordination for schools.
//!
//! Fans an emergency out to guardians across SMS, WhatsApp and email, tracks
//! each delivery and acknowledgment, and escalates through alternate channels
//! and administrators while acknowledgments are missing.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::emergency::EmergencyController;

pub mod api;
pub mod auth;
pub mod channels;
pub mod clock;
pub mod config;
pub mod emergency;
pub mod entity;
pub mod error;
pub mod events;
pub mod render;
pub mod store;

#[derive(Clone)]
pub struct AppResources {
    pub controller: Arc<EmergencyController>,
    pub config: Arc<AppConfig>,
}
