//! dfstore client functionality.

mod stub;

pub use stub::{MasterStub, StubError, DEFAULT_REPLY_TIMEOUT};
