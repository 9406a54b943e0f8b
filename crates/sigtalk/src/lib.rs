pub mod cli;
pub mod client_side;
pub mod server_side;
pub mod shutdown;
pub mod signal_cell;
pub mod tracing_init;
