pub mod config;
pub mod metrics;
pub mod peer;
pub mod probe;
pub mod server;
pub mod transponder;
pub mod util;
pub mod test_util;
