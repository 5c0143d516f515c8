//! Simulated hardware for the device roles.
//!
//! The real SPI driver of the backplane and the target-module firmware are outside this
//! repository. These backends answer every command with plausible readings so that a full
//! network can be run and tested on one machine.
pub mod backplane;
pub mod module;
