pub mod driver;
pub mod port;

pub use driver::{Line, LineState};
pub use port::{ModemPort, SerialModemPort};
