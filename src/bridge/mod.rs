pub mod controller;
pub mod prompt;
pub mod recorder;

pub use controller::{Bridge, CallOrigin};
pub use prompt::PromptPlayer;
pub use recorder::CallRecorder;
