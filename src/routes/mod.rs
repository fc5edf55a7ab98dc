pub mod routes;

pub use self::routes::{AppState, routes};
