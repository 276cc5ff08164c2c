pub mod codec;
pub mod control;
pub mod result;
pub mod task;

pub use codec::{decode, encode, CodecError};
pub use control::ControlEvent;
pub use result::CheckResult;
pub use task::{Credential, Task};

/// Database-assigned team id. Zero is never a valid team.
pub type TeamId = i32;

/// Round ids start at 1 and are contiguous.
pub type RoundId = i32;
