//! Voyager: renders `voyager.appscode.com` Ingress resources into HAProxy
//! configuration and keeps ACME certificates issued and renewed.

pub mod api;
pub mod certificate;
pub mod config;
pub mod controller;
pub mod error;
pub mod eventer;
pub mod haproxy;
pub mod ingress;
pub mod resolvers;
pub mod retry;

pub use error::{Error, Result};
