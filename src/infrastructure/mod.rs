pub mod bluetooth;
pub mod ipc;
pub mod logging;
pub mod session_log;
