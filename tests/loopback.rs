//! Integration tests over a pseudo-terminal pair.
//!
//! A pty stands in for the virtual COM pair this kind of library is normally
//! exercised with: the test writes on the master side and the port under test
//! owns the slave side, so reads, timeouts and configuration go through the
//! real termios/poll machinery without hardware.

#![cfg(unix)]

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use comline::{BaudRate, DataBits, Error, Parity, SerialConfig, SerialPort, StopBits, Timeout};
use once_cell::sync::Lazy;
use pretty_assertions::assert_eq;
use serial_test::serial;

static TRACING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
});

/// Master side of a pty whose slave is the device under test.
struct PtyPair {
    master: RawFd,
    slave_path: String,
}

impl PtyPair {
    fn open() -> Self {
        Lazy::force(&TRACING);

        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        let ret = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(ret, 0, "openpty failed");

        let slave_path = unsafe { CStr::from_ptr(libc::ptsname(master)) }
            .to_str()
            .expect("pty path is utf-8")
            .to_string();

        // Drop the slave descriptor openpty handed us; the port under test
        // opens the path itself, and a lingering descriptor would keep
        // exclusive mode latched after the port closes.
        unsafe { libc::close(slave) };

        Self { master, slave_path }
    }

    fn write_all(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = unsafe { libc::write(self.master, data.as_ptr().cast(), data.len()) };
            assert!(n > 0, "pty master write failed");
            data = &data[n as usize..];
        }
    }

    fn read_exact(&self, buf: &mut [u8]) {
        let mut filled = 0;
        while filled < buf.len() {
            let n = unsafe {
                libc::read(
                    self.master,
                    buf[filled..].as_mut_ptr().cast(),
                    buf.len() - filled,
                )
            };
            assert!(n > 0, "pty master read failed");
            filled += n as usize;
        }
    }
}

impl Drop for PtyPair {
    fn drop(&mut self) {
        unsafe { libc::close(self.master) };
    }
}

fn wait_for_pending_input(port: &SerialPort, at_least: usize) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while port.bytes_to_read().unwrap() < at_least {
        assert!(Instant::now() < deadline, "data never reached the port");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn open_missing_device_fails_not_found() {
    Lazy::force(&TRACING);
    let result = SerialPort::open("/dev/ttyNOSUCHPORT99");
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn open_non_tty_device_fails_not_found() {
    Lazy::force(&TRACING);
    let result = SerialPort::open("/dev/null");
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn second_open_is_denied_while_port_is_held() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    let result = SerialPort::open(&pty.slave_path);
    assert!(matches!(result, Err(Error::AccessDenied(_))));

    port.close();
}

#[test]
fn byte_order_is_preserved_across_the_line() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    let outgoing: Vec<u8> = (0..50).collect();
    pty.write_all(&outgoing);

    let mut received = Vec::new();
    let mut buf = [0u8; 50];
    while received.len() < 50 {
        let n = port.read(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received[0], 0);
    assert_eq!(received[25], 25);
    assert_eq!(received[49], 49);
    assert_eq!(received, outgoing);
}

#[test]
fn port_writes_reach_the_peer() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    let mut sent = 0;
    while sent < 5 {
        sent += port.write(&b"hello"[sent..]).unwrap();
    }

    let mut buf = [0u8; 5];
    pty.read_exact(&mut buf);
    assert_eq!(&buf, b"hello");
}

#[test]
#[serial]
fn bounded_read_blocks_at_least_the_full_timeout() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();
    port.set_timeout(Timeout::Milliseconds(110)).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|scope| {
        let port = &port;
        scope.spawn(move || {
            started_tx.send(()).unwrap();
            let begun = Instant::now();
            let mut buf = [0u8; 5];
            let result = port.read(&mut buf);
            done_tx.send((result, begun.elapsed())).unwrap();
        });

        started_rx.recv().unwrap();
        // Still blocked when checked at 100 ms elapsed...
        assert!(
            done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "read returned before its 110 ms bound"
        );
        // ...and back with zero bytes shortly after the bound.
        let (result, elapsed) = done_rx
            .recv_timeout(Duration::from_millis(200))
            .expect("read overran its bound by far more than scheduling slack");
        assert_eq!(result.unwrap(), 0, "timeout expiry is a zero-byte read");
        assert!(elapsed >= Duration::from_millis(110));
    });
}

#[test]
#[serial]
fn immediate_timeout_never_blocks() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();
    port.set_timeout(Timeout::Immediate).unwrap();

    // Nothing buffered: returns at once with nothing.
    let started = Instant::now();
    let mut buf = [0u8; 16];
    assert_eq!(port.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_millis(50));

    // Data buffered: returns it, still without blocking.
    pty.write_all(&[7, 8, 9]);
    wait_for_pending_input(&port, 3);
    let n = port.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[7, 8, 9]);
}

#[test]
fn infinite_read_returns_partial_data_as_it_arrives() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    pty.write_all(&[1, 2, 3]);

    // A 64-byte buffer must not make the read wait for 64 bytes.
    let mut buf = [0u8; 64];
    let n = port.read(&mut buf).unwrap();
    assert!(n >= 1 && n <= 3);
    assert_eq!(buf[0], 1);
}

#[test]
fn configuration_persists_across_close_and_reopen() {
    let pty = PtyPair::open();
    let config = SerialConfig::new(
        BaudRate::B57600,
        Parity::Even,
        StopBits::Two,
        DataBits::Seven,
    );

    let port = SerialPort::open(&pty.slave_path).unwrap();
    port.set_config(&config).unwrap();
    assert_eq!(port.config().unwrap(), config);
    port.close();

    // A fresh handle reads the configuration the driver retained.
    let port = SerialPort::open(&pty.slave_path).unwrap();
    assert_eq!(port.config().unwrap(), config);
    port.close();
}

#[test]
fn unsupported_configuration_is_rejected_at_apply_time() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    let config = SerialConfig::new(
        BaudRate::B115200,
        Parity::None,
        StopBits::OneAndHalf,
        DataBits::Eight,
    );
    let result = port.set_config(&config);
    assert!(matches!(result, Err(Error::UnsupportedConfig(_))));

    // The failed apply must not have corrupted the handle.
    port.set_config(&SerialConfig::default()).unwrap();
    assert_eq!(port.config().unwrap(), SerialConfig::default());
}

#[test]
#[serial]
fn close_from_another_thread_unblocks_infinite_read() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut buf = [0u8; 8];
            port.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(100));
        let closing = Instant::now();
        port.close();
        let result = reader.join().unwrap();

        assert!(matches!(result, Err(Error::ClosedPort)));
        assert!(
            closing.elapsed() < Duration::from_millis(250),
            "blocked read did not unblock promptly on close"
        );
    });
}

#[test]
fn operations_on_a_closed_port_fail() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();
    assert!(port.is_open());

    port.close();
    assert!(!port.is_open());

    let mut buf = [0u8; 4];
    assert!(matches!(port.read(&mut buf), Err(Error::ClosedPort)));
    assert!(matches!(port.write(b"x"), Err(Error::ClosedPort)));
    assert!(matches!(port.config(), Err(Error::ClosedPort)));
    assert!(matches!(
        port.set_config(&SerialConfig::default()),
        Err(Error::ClosedPort)
    ));
    assert!(matches!(
        port.set_timeout(Timeout::Immediate),
        Err(Error::ClosedPort)
    ));

    // Closing again neither fails nor hangs.
    port.close();
}

#[test]
fn discard_buffers_drops_pending_input() {
    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    pty.write_all(b"stale data");
    wait_for_pending_input(&port, 10);

    port.discard_buffers().unwrap();
    port.set_timeout(Timeout::Immediate).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(port.read(&mut buf).unwrap(), 0);
    assert_eq!(port.bytes_to_read().unwrap(), 0);
}

#[test]
fn stream_adapter_reads_and_writes() {
    use std::io::{Read, Write};

    let pty = PtyPair::open();
    let port = SerialPort::open(&pty.slave_path).unwrap();

    let mut writer = &port;
    writer.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    pty.read_exact(&mut buf);
    assert_eq!(&buf, b"ping");

    pty.write_all(b"pong");
    let mut reader = &port;
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    // On a bounded timeout the stream view surfaces expiry as TimedOut.
    port.set_timeout(Timeout::Milliseconds(20)).unwrap();
    let err = Read::read(&mut reader, &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}
