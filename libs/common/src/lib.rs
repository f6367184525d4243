//! Common library for the hotel concierge backend
//!
//! This crate provides shared functionality used by the device and calendar
//! services: database connectivity and migrations, the Redis cache, phone
//! number normalization, and the client for the external inference service.
//!
//! ```rust
//! use common::phone::{device_id_for, normalize};
//!
//! let number = normalize("+55 (11) 98765-4321", "55");
//! assert_eq!(number, "5511987654321");
//! assert_eq!(device_id_for(&number), "device-5511987654321");
//! ```

pub mod cache;
pub mod database;
pub mod error;
pub mod inference;
pub mod phone;
