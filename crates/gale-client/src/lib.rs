pub mod connection;
pub mod correlator;
pub mod echo;
pub mod loopback;
pub mod session;

pub use connection::*;
pub use correlator::*;
pub use echo::*;
pub use loopback::*;
pub use session::*;
