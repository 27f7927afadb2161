//! Serial line configuration types.
//!
//! A [`SerialConfig`] bundles the four framing parameters (baud rate, parity,
//! stop bits, data bits) as an immutable value; changing a parameter means
//! building a new value and applying it with
//! [`SerialPort::set_config`](crate::SerialPort::set_config). [`Timeout`]
//! governs how long a single read may block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Baud rate (bits per second) of the serial line.
///
/// The set of rates is closed; whether a given rate is accepted is ultimately
/// up to the native driver, and rejection surfaces as
/// [`Error::UnsupportedConfig`](crate::Error::UnsupportedConfig) when the
/// configuration is applied. `B14400`, `B128000` and `B256000` are only
/// available on Windows drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaudRate {
    B110,
    B300,
    B600,
    B1200,
    B2400,
    B4800,
    B9600,
    B14400,
    B19200,
    B38400,
    B57600,
    B115200,
    B128000,
    B256000,
}

impl BaudRate {
    /// The rate in bits per second.
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B110 => 110,
            BaudRate::B300 => 300,
            BaudRate::B600 => 600,
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B14400 => 14_400,
            BaudRate::B19200 => 19_200,
            BaudRate::B38400 => 38_400,
            BaudRate::B57600 => 57_600,
            BaudRate::B115200 => 115_200,
            BaudRate::B128000 => 128_000,
            BaudRate::B256000 => 256_000,
        }
    }

    /// Look up the enum member for a numeric rate.
    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.bits_per_second() == bps)
    }

    pub(crate) const ALL: [BaudRate; 14] = [
        BaudRate::B110,
        BaudRate::B300,
        BaudRate::B600,
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B14400,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B128000,
        BaudRate::B256000,
    ];
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// Parity checking mode.
///
/// `Mark` and `Space` are native on Windows and emulated via `CMSPAR` on
/// Linux; other POSIX systems reject them at apply time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub(crate) const ALL: [Parity; 5] = [
        Parity::None,
        Parity::Odd,
        Parity::Even,
        Parity::Mark,
        Parity::Space,
    ];
}

/// Number of stop bits per character.
///
/// `OneAndHalf` exists only on Windows drivers; POSIX termios has no
/// representation for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OneAndHalf,
    Two,
}

impl StopBits {
    pub(crate) const ALL: [StopBits; 3] = [StopBits::One, StopBits::OneAndHalf, StopBits::Two];
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    /// The bit count as a plain number.
    pub fn bit_count(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }

    pub(crate) const ALL: [DataBits; 4] = [
        DataBits::Five,
        DataBits::Six,
        DataBits::Seven,
        DataBits::Eight,
    ];
}

/// Line configuration of a serial port.
///
/// Equality is structural; two configs compare equal exactly when all four
/// parameters match. The value read back by
/// [`SerialPort::config`](crate::SerialPort::config) comes from the driver,
/// so it reflects whatever the device is actually running, including state
/// left behind by a previous handle or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialConfig {
    pub baud_rate: BaudRate,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
}

impl SerialConfig {
    pub fn new(
        baud_rate: BaudRate,
        parity: Parity,
        stop_bits: StopBits,
        data_bits: DataBits,
    ) -> Self {
        Self {
            baud_rate,
            parity,
            stop_bits,
            data_bits,
        }
    }
}

impl Default for SerialConfig {
    /// 9600 baud, 8 data bits, no parity, 1 stop bit.
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::B9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
        }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBits::One => "1",
            StopBits::OneAndHalf => "1.5",
            StopBits::Two => "2",
        };
        write!(
            f,
            "{}-{}{}{}",
            self.baud_rate,
            self.data_bits.bit_count(),
            parity,
            stop
        )
    }
}

/// Maximum blocking duration of a single read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeout {
    /// Block until at least one byte is available.
    Infinite,
    /// Never block; return whatever is currently buffered, possibly nothing.
    Immediate,
    /// Block up to this many milliseconds, returning early as soon as any
    /// data arrives. Expiry yields a zero-byte read, not an error.
    Milliseconds(u32),
}

impl Timeout {
    /// Build a timeout from a millisecond count; zero normalizes to
    /// [`Timeout::Immediate`].
    pub fn from_millis(ms: u32) -> Self {
        if ms == 0 {
            Timeout::Immediate
        } else {
            Timeout::Milliseconds(ms)
        }
    }

    /// The bounded duration, if any.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Immediate => Some(Duration::ZERO),
            Timeout::Milliseconds(ms) => Some(Duration::from_millis(u64::from(ms))),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Infinite
    }
}
