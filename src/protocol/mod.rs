//! # Request Pipeline
//!
//! Requests built by the readers, the handler registry and the worker pool that
//! runs them.

pub mod controller;
pub mod dispatcher;
pub mod request;

pub use controller::{DeliveryReport, RequestController, RequestQueue};
pub use dispatcher::Dispatcher;
pub use request::{Request, RequestEvent, RequestPriority, Response};
