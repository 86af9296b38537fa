// Library surface shared by the server binary and the integration tests.
pub mod accel;
pub mod config;
pub mod gnss;
pub mod logging;
pub mod session;
