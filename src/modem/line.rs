//! Caller-facing serial endpoints: the modem's TTY and, for testing without
//! hardware, the local terminal.

use crate::poller;
use log::debug;
use nix::sys::termios::{self, SetArg, Termios};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// I/O timeout on a hardware port. Reads are only issued once bytes are
/// waiting, so in practice this bounds writes held back by RTS/CTS.
pub const PORT_TIMEOUT: Duration = Duration::from_secs(2);

/// The serial line a caller arrives on.
///
/// The gateway only manipulates control lines and moves bytes; opening and
/// closing the line belongs to whoever created it.
pub trait SerialLine: Read + Write {
    /// Bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Discard anything buffered on the input side.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Set the Data Terminal Ready control line.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Carrier-detect signal, or `None` when the line has no such signal.
    fn carrier_detect(&mut self) -> Option<bool> {
        None
    }

    /// Local/loopback lines are never considered to lose carrier.
    fn is_local(&self) -> bool {
        false
    }

    /// Descriptor that becomes readable when caller input arrives.
    fn poll_fd(&self) -> BorrowedFd<'_>;
}

#[cfg(feature = "serial")]
pub use hardware::HardwareLine;

#[cfg(feature = "serial")]
mod hardware {
    use super::{SerialLine, PORT_TIMEOUT};
    use crate::error::Result;
    use log::{debug, info};
    use serialport::{ClearBuffer, SerialPort, TTYPort};
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, BorrowedFd};

    /// A real modem on a TTY device.
    pub struct HardwareLine {
        port: TTYPort,
    }

    impl HardwareLine {
        /// Open `path` 8N1 at `baud_rate` with DTR raised.
        pub fn open(path: &str, baud_rate: u32, hardware_flow_control: bool) -> Result<Self> {
            info!("Opening modem on {} at {} baud", path, baud_rate);
            let flow = if hardware_flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            };
            let mut port = serialport::new(path, baud_rate)
                .timeout(PORT_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .flow_control(flow)
                .open_native()?;
            port.write_data_terminal_ready(true)?;
            debug!("Modem port {} open, DTR raised", path);
            Ok(Self { port })
        }
    }

    impl Read for HardwareLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.port.read(buf)
        }
    }

    impl Write for HardwareLine {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.port.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.port.flush()
        }
    }

    impl SerialLine for HardwareLine {
        fn bytes_to_read(&mut self) -> io::Result<usize> {
            Ok(self.port.bytes_to_read()? as usize)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(self.port.clear(ClearBuffer::Input)?)
        }

        fn set_dtr(&mut self, level: bool) -> io::Result<()> {
            Ok(self.port.write_data_terminal_ready(level)?)
        }

        fn carrier_detect(&mut self) -> Option<bool> {
            match self.port.read_carrier_detect() {
                Ok(cd) => Some(cd),
                Err(e) => {
                    debug!("Carrier detect unavailable: {}", e);
                    None
                }
            }
        }

        fn poll_fd(&self) -> BorrowedFd<'_> {
            // SAFETY: the descriptor is owned by `self.port`, which outlives the borrow.
            unsafe { BorrowedFd::borrow_raw(self.port.as_raw_fd()) }
        }
    }
}

/// The process's own terminal standing in for a modem line.
///
/// Puts stdin in raw mode for the lifetime of the value and restores the
/// original settings on drop. DTR is a no-op and there is no carrier signal.
pub struct LocalLine {
    input: File,
    output: File,
    saved: Option<Termios>,
}

impl LocalLine {
    pub fn new() -> crate::error::Result<Self> {
        let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let output = File::from(io::stdout().as_fd().try_clone_to_owned()?);
        let saved = termios::tcgetattr(&input)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&input, SetArg::TCSANOW, &raw)?;
        debug!("Local terminal switched to raw mode");
        Ok(Self {
            input,
            output,
            saved: Some(saved),
        })
    }
}

impl Drop for LocalLine {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let _ = termios::tcsetattr(&self.input, SetArg::TCSADRAIN, &saved);
        }
    }
}

impl Read for LocalLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for LocalLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

impl SerialLine for LocalLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(usize::from(poller::is_readable(self.input.as_fd())?))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }

    fn is_local(&self) -> bool {
        true
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::PORT_TIMEOUT;
    use std::time::Duration;

    #[test]
    fn port_timeout_leaves_room_for_flow_control() {
        assert!(PORT_TIMEOUT >= Duration::from_secs(1));
    }
}
