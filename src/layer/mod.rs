pub mod database;
pub mod model;
pub mod source;
pub mod store;
pub mod sublayers;
