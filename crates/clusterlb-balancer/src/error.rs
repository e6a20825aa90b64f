//! Routing error types.

use thiserror::Error;

/// Terminal failures of a routing decision.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No registered context serves the request path.
    #[error("no context serves this request")]
    NoContext,

    /// Contexts exist, but every candidate worker is exhausted.
    #[error("all workers of balancer {0} are unavailable")]
    Unavailable(String),

    #[error("state store error: {0}")]
    State(#[from] clusterlb_state::StateError),
}

impl RouteError {
    /// HTTP status a dispatcher should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            RouteError::NoContext => 404,
            RouteError::Unavailable(_) => 503,
            RouteError::State(_) => 500,
        }
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
