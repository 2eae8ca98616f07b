//! # homeguard
//!
//! Core of an event-driven home automation agent.
//!
//! Modules react to sensor events and user commands and push background
//! work onto a priority [`queue::TaskQueue`], consumed by a single
//! [`worker::Worker`]. A [`queue::UniqueTaskQueue`] keeps recurring jobs
//! from stacking up, [`signal`] provides named broadcast channels and
//! [`state::ObservableState`] holds shared flags with change subscriptions.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod module;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod signal;
pub mod state;
pub mod telemetry;
pub mod worker;
