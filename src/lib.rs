//! Chat-driven object detection pipeline
//!
//! This library provides the ingestion server and the detection worker: photos
//! arrive over a Telegram webhook or a multipart upload, are stored in an
//! S3-compatible bucket and published as jobs on a Redis queue. Workers run an
//! external detector over each job, persist the result in PostgreSQL and only
//! then acknowledge the queue message.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
pub mod worker;
