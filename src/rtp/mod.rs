pub mod g711;
pub mod session;

pub use g711::G711Codec;
pub use session::{RtpSession, PT_EVENT, PT_PCMA, PT_PCMU};
