//! SSH port and unit name allocation.

pub mod naming;
pub mod port_allocator;

pub use port_allocator::{allocate_port, Clock, PortAllocator, Reservation};
