pub mod clock;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod types;

pub use codec::*;
pub use error::*;
pub use metrics::*;
pub use protocol::*;
pub use types::*;
