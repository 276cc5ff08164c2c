pub mod bootstrap;
pub mod logging;
pub mod rabbit;
pub mod stop;
