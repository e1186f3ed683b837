//! Turning host inputs into a resolved stage.

pub mod host;
pub mod request;
pub mod resolver;
