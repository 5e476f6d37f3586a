pub mod digest;
pub mod message;
pub mod phone;

pub use digest::{AuthState, DigestChallenge};
pub use message::{Method, SipMessage};
pub use phone::{IpPhone, PhoneState};
