pub mod helpers;
pub mod transport;
