//! HTTP control surface (C7): health, metrics, status, logs, and action
//! dispatch. Built on `axum::Router` with a shared `ControlAppState`,
//! the same shape as the teacher's `control_routes.rs`.

mod routes;

pub use routes::{control_router, ControlAppState};
