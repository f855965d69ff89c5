//! Mesh sidecar decision core.
//!
//! For every inbound and outbound HTTP request the sidecar decides which
//! route applies, which cluster endpoint serves it, whether to retry or fail
//! over, and which transport reaches the endpoint: plain TCP, mTLS, or a
//! SOCKS tunnel through an egress gateway.
//!
//! All routing state is compiled from a [`mesh::MeshConfig`] snapshot into a
//! [`generation::Generation`] and swapped atomically on reload.

pub mod admin;
pub mod admin_listener;
pub mod cluster;
pub mod config;
pub mod egress;
pub mod error;
pub mod generation;
pub mod listener;
pub mod mesh;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod service;
pub mod socket;
pub mod tls;
pub mod transport;
