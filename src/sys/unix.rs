//! POSIX backend: termios for configuration, `poll(2)` for timeout-governed
//! blocking.
//!
//! The descriptor stays in non-blocking mode for its whole life; every
//! blocking semantic is built from `poll` over the port fd and a self-pipe.
//! Writing a byte to the pipe is what lets `close()` on one thread yank
//! another thread out of a blocked read, and the byte is never drained so the
//! wake-up is permanent.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{BaudRate, DataBits, Parity, SerialConfig, StopBits, Timeout};
use crate::error::{Error, Result};
use crate::sys::RawPort;

pub(crate) struct TtyPort {
    fd: RawFd,
    wake_rd: RawFd,
    wake_wr: RawFd,
    released: AtomicBool,
}

/// Outcome of one `poll` round. `TimedOut` also covers `EINTR`; every caller
/// loops, so a signal just re-evaluates the deadline.
enum Wait {
    Ready,
    TimedOut,
    Woken,
}

impl TtyPort {
    pub(crate) fn open(name: &str) -> Result<Self> {
        let path = CString::new(name).map_err(|_| Error::not_found(name))?;

        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::from_open(name, io::Error::last_os_error()));
        }

        // Exclusive access; a second open of the same device fails EBUSY.
        if unsafe { libc::ioctl(fd, libc::TIOCEXCL) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from_open(name, err));
        }

        let mut tty: libc::termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut tty) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from_open(name, err));
        }

        // Raw session flags only. Baud rate, character size, parity and stop
        // bits are left exactly as the driver has them, so configuration set
        // by a previous handle is still observable through `native_config`.
        raw_session_flags(&mut tty);
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tty) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from_open(name, err));
        }

        let (wake_rd, wake_wr) = match anon_pipe() {
            Ok(pair) => pair,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(Error::Driver(err));
            }
        };

        Ok(Self {
            fd,
            wake_rd,
            wake_wr,
            released: AtomicBool::new(false),
        })
    }

    fn wait_event(&self, events: libc::c_short, timeout_ms: libc::c_int) -> Result<Wait> {
        let mut fds = [
            libc::pollfd {
                fd: self.fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Wait::TimedOut);
            }
            return Err(Error::Driver(err));
        }
        if ret == 0 {
            return Ok(Wait::TimedOut);
        }
        // The wake pipe wins over readiness on the port: a close that races a
        // data arrival must still cancel the call.
        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(Wait::Woken);
        }
        Ok(Wait::Ready)
    }

    /// Non-blocking read. `Ok(None)` means nothing available right now.
    fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(Error::Driver(err)),
            };
        }
        if n == 0 && !buf.is_empty() {
            // EOF on a tty fd: the device went away under us.
            return Err(Error::Driver(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial device disconnected",
            )));
        }
        Ok(Some(n as usize))
    }

    fn fetch_termios(&self) -> Result<libc::termios> {
        let mut tty: libc::termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(self.fd, &mut tty) } != 0 {
            return Err(Error::Driver(io::Error::last_os_error()));
        }
        Ok(tty)
    }
}

impl RawPort for TtyPort {
    fn read_with_timeout(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        match timeout {
            Timeout::Immediate => Ok(self.try_read(buf)?.unwrap_or(0)),
            Timeout::Infinite => loop {
                match self.wait_event(libc::POLLIN, -1)? {
                    Wait::Woken => return Err(Error::ClosedPort),
                    Wait::TimedOut => continue,
                    Wait::Ready => {
                        if let Some(n) = self.try_read(buf)? {
                            return Ok(n);
                        }
                    }
                }
            },
            Timeout::Milliseconds(ms) => {
                let deadline = Instant::now() + Duration::from_millis(u64::from(ms));
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(0);
                    }
                    match self.wait_event(libc::POLLIN, ceil_millis(remaining))? {
                        Wait::Woken => return Err(Error::ClosedPort),
                        Wait::TimedOut => continue,
                        Wait::Ready => {
                            if let Some(n) = self.try_read(buf)? {
                                return Ok(n);
                            }
                        }
                    }
                }
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            match self.wait_event(libc::POLLOUT, -1)? {
                Wait::Woken => return Err(Error::ClosedPort),
                Wait::TimedOut => continue,
                Wait::Ready => {
                    let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
                    if n < 0 {
                        let err = io::Error::last_os_error();
                        match err.raw_os_error() {
                            Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                            _ => return Err(Error::Driver(err)),
                        }
                    }
                    return Ok(n as usize);
                }
            }
        }
    }

    fn native_config(&self) -> Result<SerialConfig> {
        decode(&self.fetch_termios()?)
    }

    fn set_native_config(&self, config: &SerialConfig) -> Result<()> {
        let mut tty = self.fetch_termios()?;
        encode_into(config, &mut tty)?;
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &tty) } != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINVAL) => Err(Error::unsupported(config.to_string())),
                _ => Err(Error::Driver(err)),
            };
        }
        // tcsetattr reports success if *any* requested change stuck; read the
        // state back so a partial apply surfaces instead of lingering.
        let applied = decode(&self.fetch_termios()?)?;
        if applied != *config {
            return Err(Error::unsupported(format!(
                "driver rejected {config}, active configuration is {applied}"
            )));
        }
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<usize> {
        let mut available: libc::c_int = 0;
        if unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut available) } < 0 {
            return Err(Error::Driver(io::Error::last_os_error()));
        }
        Ok(available as usize)
    }

    fn discard_buffers(&self) -> Result<()> {
        if unsafe { libc::tcflush(self.fd, libc::TCIOFLUSH) } != 0 {
            return Err(Error::Driver(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn wake(&self) {
        let token = [1u8];
        // The pipe is never drained, so one byte keeps every later poll hot.
        let _ = unsafe { libc::write(self.wake_wr, token.as_ptr().cast(), 1) };
    }

    fn close_native(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for fd in [self.fd, self.wake_rd, self.wake_wr] {
            if unsafe { libc::close(fd) } != 0 {
                tracing::warn!(
                    fd,
                    error = %io::Error::last_os_error(),
                    "ignoring error while releasing serial descriptor"
                );
            }
        }
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        self.close_native();
    }
}

/// Put the line in raw byte-at-a-time mode without touching the four framing
/// parameters (speed, character size, parity, stop bits).
fn raw_session_flags(tty: &mut libc::termios) {
    tty.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::INPCK
        | libc::IXON
        | libc::IXOFF
        | libc::IXANY);
    tty.c_oflag &= !libc::OPOST;
    tty.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
    tty.c_cflag |= libc::CLOCAL | libc::CREAD;
    tty.c_cflag &= !libc::CRTSCTS;
    // poll() does all the timing; the driver itself never blocks us.
    tty.c_cc[libc::VMIN] = 0;
    tty.c_cc[libc::VTIME] = 0;
}

fn anon_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            || unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0
        {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Round up to whole milliseconds so the final poll covers the full bound;
/// rounding down would let a read return just before its deadline.
fn ceil_millis(duration: Duration) -> libc::c_int {
    let mut ms = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(i32::MAX as u128) as libc::c_int
}

// ===== configuration codec =====

fn encode_speed(baud: BaudRate) -> Result<libc::speed_t> {
    match baud {
        BaudRate::B110 => Ok(libc::B110),
        BaudRate::B300 => Ok(libc::B300),
        BaudRate::B600 => Ok(libc::B600),
        BaudRate::B1200 => Ok(libc::B1200),
        BaudRate::B2400 => Ok(libc::B2400),
        BaudRate::B4800 => Ok(libc::B4800),
        BaudRate::B9600 => Ok(libc::B9600),
        BaudRate::B19200 => Ok(libc::B19200),
        BaudRate::B38400 => Ok(libc::B38400),
        BaudRate::B57600 => Ok(libc::B57600),
        BaudRate::B115200 => Ok(libc::B115200),
        BaudRate::B14400 | BaudRate::B128000 | BaudRate::B256000 => Err(Error::unsupported(
            format!("baud rate {} has no termios constant", baud),
        )),
    }
}

fn decode_speed(speed: libc::speed_t) -> Result<BaudRate> {
    match speed {
        libc::B110 => Ok(BaudRate::B110),
        libc::B300 => Ok(BaudRate::B300),
        libc::B600 => Ok(BaudRate::B600),
        libc::B1200 => Ok(BaudRate::B1200),
        libc::B2400 => Ok(BaudRate::B2400),
        libc::B4800 => Ok(BaudRate::B4800),
        libc::B9600 => Ok(BaudRate::B9600),
        libc::B19200 => Ok(BaudRate::B19200),
        libc::B38400 => Ok(BaudRate::B38400),
        libc::B57600 => Ok(BaudRate::B57600),
        libc::B115200 => Ok(BaudRate::B115200),
        other => Err(Error::unsupported(format!(
            "termios speed constant {other} is not a representable baud rate"
        ))),
    }
}

fn encode_parity(parity: Parity, cflag: &mut libc::tcflag_t) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        *cflag &= !(libc::PARENB | libc::PARODD | libc::CMSPAR);
        match parity {
            Parity::None => {}
            Parity::Odd => *cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => *cflag |= libc::PARENB,
            Parity::Mark => *cflag |= libc::PARENB | libc::PARODD | libc::CMSPAR,
            Parity::Space => *cflag |= libc::PARENB | libc::CMSPAR,
        }
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        *cflag &= !(libc::PARENB | libc::PARODD);
        match parity {
            Parity::None => {}
            Parity::Odd => *cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => *cflag |= libc::PARENB,
            Parity::Mark | Parity::Space => {
                return Err(Error::unsupported(
                    "mark/space parity is not available on this platform",
                ));
            }
        }
        Ok(())
    }
}

fn decode_parity(cflag: libc::tcflag_t) -> Parity {
    if cflag & libc::PARENB == 0 {
        return Parity::None;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if cflag & libc::CMSPAR != 0 {
        return if cflag & libc::PARODD != 0 {
            Parity::Mark
        } else {
            Parity::Space
        };
    }
    if cflag & libc::PARODD != 0 {
        Parity::Odd
    } else {
        Parity::Even
    }
}

/// Encode a configuration into an existing termios snapshot, leaving session
/// flags alone. Fails with `UnsupportedConfig` for members this platform's
/// driver cannot express.
fn encode_into(config: &SerialConfig, tty: &mut libc::termios) -> Result<()> {
    let speed = encode_speed(config.baud_rate)?;
    unsafe {
        if libc::cfsetispeed(tty, speed) != 0 || libc::cfsetospeed(tty, speed) != 0 {
            return Err(Error::unsupported(format!(
                "baud rate {} rejected by cfsetspeed",
                config.baud_rate
            )));
        }
    }

    tty.c_cflag &= !libc::CSIZE;
    tty.c_cflag |= match config.data_bits {
        DataBits::Five => libc::CS5,
        DataBits::Six => libc::CS6,
        DataBits::Seven => libc::CS7,
        DataBits::Eight => libc::CS8,
    };

    encode_parity(config.parity, &mut tty.c_cflag)?;

    match config.stop_bits {
        StopBits::One => tty.c_cflag &= !libc::CSTOPB,
        StopBits::Two => tty.c_cflag |= libc::CSTOPB,
        StopBits::OneAndHalf => {
            return Err(Error::unsupported(
                "1.5 stop bits have no termios representation",
            ));
        }
    }

    Ok(())
}

/// Decode the four framing parameters out of a termios snapshot.
fn decode(tty: &libc::termios) -> Result<SerialConfig> {
    let baud_rate = decode_speed(unsafe { libc::cfgetospeed(tty) })?;

    let data_bits = match tty.c_cflag & libc::CSIZE {
        libc::CS5 => DataBits::Five,
        libc::CS6 => DataBits::Six,
        libc::CS7 => DataBits::Seven,
        libc::CS8 => DataBits::Eight,
        other => {
            return Err(Error::unsupported(format!(
                "unrecognized character size bits {other:#x}"
            )));
        }
    };

    let parity = decode_parity(tty.c_cflag);

    let stop_bits = if tty.c_cflag & libc::CSTOPB != 0 {
        StopBits::Two
    } else {
        StopBits::One
    };

    Ok(SerialConfig {
        baud_rate,
        parity,
        stop_bits,
        data_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn blank_termios() -> libc::termios {
        unsafe { mem::zeroed() }
    }

    /// Members that can never encode on a POSIX driver, independent of the
    /// rest of the configuration.
    fn posix_unsupported(config: &SerialConfig) -> bool {
        let baud = matches!(
            config.baud_rate,
            BaudRate::B14400 | BaudRate::B128000 | BaudRate::B256000
        );
        let stop = config.stop_bits == StopBits::OneAndHalf;
        let parity = if cfg!(any(target_os = "linux", target_os = "android")) {
            false
        } else {
            matches!(config.parity, Parity::Mark | Parity::Space)
        };
        baud || stop || parity
    }

    #[test]
    fn codec_roundtrip_every_encodable_config() {
        for baud_rate in BaudRate::ALL {
            for parity in Parity::ALL {
                for stop_bits in StopBits::ALL {
                    for data_bits in DataBits::ALL {
                        let config = SerialConfig {
                            baud_rate,
                            parity,
                            stop_bits,
                            data_bits,
                        };
                        let mut tty = blank_termios();
                        match encode_into(&config, &mut tty) {
                            Ok(()) => {
                                let back = decode(&tty).expect("encoded termios must decode");
                                assert_eq!(back, config);
                            }
                            Err(Error::UnsupportedConfig(_)) => {
                                assert!(
                                    posix_unsupported(&config),
                                    "{config} should be encodable here"
                                );
                            }
                            Err(other) => panic!("unexpected encode error: {other}"),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn decode_rejects_foreign_speed() {
        // A zeroed termios carries B0, which is not a representable rate.
        let err = decode(&blank_termios()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfig(_)));
    }

    #[test]
    fn raw_flags_preserve_framing_parameters() {
        let mut tty = blank_termios();
        let config = SerialConfig::new(
            BaudRate::B57600,
            Parity::Even,
            StopBits::Two,
            DataBits::Seven,
        );
        encode_into(&config, &mut tty).unwrap();

        raw_session_flags(&mut tty);
        assert_eq!(decode(&tty).unwrap(), config);
    }

    #[test]
    fn ceil_millis_rounds_up() {
        assert_eq!(ceil_millis(Duration::from_millis(110)), 110);
        assert_eq!(ceil_millis(Duration::from_micros(110_400)), 111);
        assert_eq!(ceil_millis(Duration::from_nanos(1)), 1);
        assert_eq!(ceil_millis(Duration::ZERO), 0);
    }
}
