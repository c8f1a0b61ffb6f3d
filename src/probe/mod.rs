pub mod correlate;
pub mod interface;
pub mod socket;

pub use correlate::*;
pub use interface::*;
pub use socket::*;
