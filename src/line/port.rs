/// Serial link to the voice modem
///
/// The line driver only needs a byte stream with non-blocking reads and
/// writes plus queue-depth introspection, so that is the whole trait.
/// Production uses a USB ACM serial device at 115200 8N1; tests drive the
/// driver through an in-memory implementation.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

pub const MODEM_BAUD: u32 = 115_200;

pub trait ModemPort: Send {
    /// Drain whatever the device has buffered; never blocks.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Queue bytes for transmission.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes waiting in the receive queue.
    fn in_queue_len(&mut self) -> usize;

    /// Bytes not yet shifted out of the transmit queue.
    fn out_queue_len(&mut self) -> usize;

    /// Discard both queues.
    fn clear_queues(&mut self) -> Result<()>;
}

/// The real thing: a serialport-backed modem link.
pub struct SerialModemPort {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialModemPort {
    /// Open `path` at 115200 8N1 with no flow control and zero timeout,
    /// so reads only ever return what is already buffered.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, MODEM_BAUD)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(0))
            .open()
            .context(format!("Failed to open modem port {}", path))?;
        debug!("Modem port {} opened at {} baud", path, MODEM_BAUD);
        Ok(Self { port })
    }
}

impl ModemPort for SerialModemPort {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let waiting = self.port.bytes_to_read().context("bytes_to_read failed")? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; waiting];
        let read = match self.port.read(&mut buf) {
            Ok(read) => read,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e).context("serial read failed"),
        };
        buf.truncate(read);
        Ok(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Write::write_all(&mut self.port, data).context("serial write failed")
    }

    fn in_queue_len(&mut self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn out_queue_len(&mut self) -> usize {
        self.port.bytes_to_write().unwrap_or(0) as usize
    }

    fn clear_queues(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .context("failed to clear serial buffers")
    }
}
