pub mod logging;
pub mod serde_helpers;

pub use logging::init_logging;
