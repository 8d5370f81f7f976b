//! Runtime half of the gateway: everything stateful built on top
//! of `acctrelay-core`'s pure domain types and storage layer. Module split
//! mirrors the crate's own module layout plus the axum HTTP
//! surface and startup wiring.

pub mod account;
pub mod api_keys;
pub mod app;
pub mod chat_id;
pub mod error;
pub mod http_clients;
pub mod json_stream;
pub mod jwt_minter;
pub mod media;
pub mod models;
pub mod normalizer;
pub mod openai_wire;
pub mod orchestrator;
pub mod poll_loop;
pub mod refresh_loop;
pub mod routes;
pub mod session_cache;
pub mod settings;
pub mod stats;
pub mod stream_engine;
pub mod subprocess;
pub mod task_queue;

pub use app::{start_server, AppState};
