pub mod models;
pub mod persist;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod test_utils;

pub use store::{PgStore, ScoreStore};
