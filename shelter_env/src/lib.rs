//! Shelter Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the Shelter observer run
//! against both the **live** simulation service (tokio + HTTP) and the
//! **simulated** one (virtual clock + in-process scripted engine).
//!
//! # Core Concept: The Reactor Pattern
//!
//! Every source of non-determinism the observer touches is intercepted:
//! - Time (`now()`, `sleep()`)
//! - Background work (`spawn()`)
//! - The simulation service (`get()`, `post()`)
//!
//! The engines in `shelter_core` never read a clock or open a socket on their
//! own; they are handed `now` and typed responses.
//!
//! # Example
//!
//! ```ignore
//! use shelter_env::{ObserverContext, SimulationTransport, Endpoint};
//!
//! async fn poll<Ctx: ObserverContext, T: SimulationTransport>(ctx: &Ctx, transport: &T) {
//!     loop {
//!         let _ = transport.get(&Endpoint::LiveState.path(), Duration::from_secs(10)).await;
//!         ctx.sleep(Duration::from_millis(2000)).await;
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;
mod http_impl;

pub use context::ObserverContext;
pub use transport::{SimulationTransport, unwrap_envelope};
pub use types::{Endpoint, TaskId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use http_impl::HttpTransport;
