//! Process setup that runs before the engine: logging.
pub mod logging;
