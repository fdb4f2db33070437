//! faasgrid-dispatch: the invocation dispatcher.
//!
//! Resolves a function to its active deployment, leases a warm instance
//! (or cold starts one through `faasgrid-scheduler`), forwards the payload
//! through an [`InstanceProxy`], and records every attempt as an
//! `InvocationRecord`. Errors follow the taxonomy in [`DispatchError`] and
//! map to HTTP status codes with [`DispatchError::status_code`].

pub mod dispatcher;
pub mod error;
pub mod proxy;

pub use dispatcher::{DEFAULT_PROXY_BUFFER, Dispatcher, InvocationOutcome, InvocationRequest};
pub use error::DispatchError;
pub use proxy::{HttpProxy, InstanceProxy, ProxyError, ProxyRequest, ProxyResponse};
