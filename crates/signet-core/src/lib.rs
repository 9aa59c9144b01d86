//! Signet Core - HTTP message model and the bearer-injection hook.
//!
//! This crate provides the protocol-independent pieces of the Signet proxy:
//! the parsed request/response values, the ordered case-preserving header
//! map, and the interception hook that rewrites the `Authorization` header
//! on matching requests.
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy Engine → parse → Request
//!                                            │
//!                                            ▼
//!                                   RequestHook::apply
//!                                   (BearerInjector)
//!                                            │
//!                                            ▼
//!                                  serialize → Origin
//! ```
//!
//! The hook is a plain function boundary: the engine calls it synchronously
//! with the parsed request before forwarding. It may mutate headers only,
//! never the method or target.

mod headers;
mod hook;
mod message;

pub use headers::HeaderMap;
pub use hook::{BearerInjector, MatchPolicy, RequestHook};
pub use message::{BodyFraming, MessageError, Method, Request, Response, Scheme, Target, Version};
