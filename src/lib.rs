//! Velotrace - a bike-share fleet tracker.
//!
//! # Overview
//!
//! Velotrace polls a station-occupancy feed, diffs successive snapshots to
//! infer which bikes moved between which stations, and materializes a trip
//! ledger from those movements. On top of the ledger it maintains per-bike
//! health signals (boomerangs, low speed, missing, stuck, battery issues)
//! and runs periodic self-healing passes that repair state after feed gaps
//! or inconsistencies.
//!
//! The system only ever sees station-level presence: a bike is either docked
//! somewhere or it is not. Everything else (trips, distances, speeds, health
//! scores) is inferred from that signal.
//!
//! # Modules
//!
//! - [`model`]: Domain types for stations, bikes, movements, trips, malfunctions
//! - [`config`]: Tuning thresholds and job intervals, loaded from environment
//! - [`error`]: Pipeline failure taxonomy
//! - [`geo`]: Great-circle distance between stations
//! - [`storage`]: SQLite fleet state store
//! - [`feed`]: HTTP client for the upstream station feed
//! - [`ingest`]: Snapshot differencer producing movement events
//! - [`trips`]: Trip reconstruction from movement events or state diffs
//! - [`malfunction`]: Bike health rule passes and scoring
//! - [`recovery`]: Data cleanup and reconciliation passes
//! - [`stats`]: Fleet-level statistics
//! - [`worker`]: Single-writer job queue serializing all mutations
//! - [`scheduler`]: Periodic job triggers
//! - [`api`]: Read-only HTTP API handlers

pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod geo;
pub mod ingest;
pub mod malfunction;
pub mod model;
pub mod recovery;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod trips;
pub mod worker;
