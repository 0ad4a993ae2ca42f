//! An interactive, MITM-capable HTTP/HTTPS forward proxy: accepts plain
//! and CONNECT requests on a proxy listener, optionally intercepts TLS by
//! minting per-host leaf certificates, and exposes a loopback control
//! surface for live event subscription, body retrieval, and approval
//! gating of in-flight requests.

pub mod ca;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod live_body;
pub mod process_info;
pub mod store;
pub mod timing;
pub mod wire;
