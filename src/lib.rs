//! Thermal - ingestion and fan-out backbone for live paragliding
//! competition tracking.
//!
//! Position reports arrive from mobile apps over HTTP, GPS trackers over
//! two binary TCP protocols, and batch uploads. Everything funnels through
//! a Redis-backed priority queue into a time-partitioned Postgres store,
//! while per-race WebSocket hubs push delayed, compressed delta updates to
//! map clients.

pub mod actions;
pub mod auth;
pub mod config;
pub mod db;
pub mod devices_repo;
pub mod flight_separator;
pub mod flights;
pub mod flights_repo;
pub mod gps_tcp;
pub mod live;
pub mod point_processor;
pub mod points;
pub mod points_repo;
pub mod queue;
pub mod races;
pub mod races_repo;
pub mod retention;
pub mod validator;
pub mod web;

pub use config::Settings;
pub use flights::{Flight, FlightSource};
pub use points::TrackPoint;
pub use queue::{QueueItem, QueueName, RedisQueue};
pub use races::Race;
