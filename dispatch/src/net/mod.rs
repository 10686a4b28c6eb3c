//! Socket abstractions generic enough to swap `mio`'s async sockets for
//! `std::net`'s blocking ones in tests.

pub mod tcp_listener;
pub mod tcp_stream;
