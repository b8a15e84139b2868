pub mod bus_info;
pub mod check;
pub mod devices;
pub mod host;
pub mod session;
