//! Control plane for ephemeral per-user lab sandboxes on Kubernetes.
//!
//! A learner picks a lab template; the [`provisioner`] builds a namespace and a
//! workload for it, the [`terminal`] bridge attaches a browser shell, the
//! [`validation`] engine checks task completion by running probes through the
//! [`exec`] bridge, and the [`monitor`] reclaims sandboxes whose time is up.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod http_server;
pub mod identity;
pub mod index;
pub mod monitor;
pub mod provisioner;
pub mod state;
pub mod template;
pub mod terminal;
pub mod validation;
