pub mod aggregate;
pub mod engine;
pub mod pending;
pub mod receiver;
pub mod sender;

pub use aggregate::*;
pub use engine::*;
pub use pending::*;
pub use receiver::*;
pub use sender::*;
