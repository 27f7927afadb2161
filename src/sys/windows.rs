//! Windows backend: overlapped I/O with COMMTIMEOUTS governing read bounds.
//!
//! Every read and write is issued overlapped and then waited on together with
//! a manual-reset shutdown event; `close()` sets that event, which cancels the
//! pending operation via `CancelIoEx` instead of leaving the thread parked in
//! the driver. The event stays signaled, so operations started after a close
//! also return immediately.

use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::{CancelIoEx, GetOverlappedResult};
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::synchapi::{CreateEventW, SetEvent, WaitForMultipleObjects};
use winapi::um::winbase::{
    ClearCommError, GetCommState, PurgeComm, SetCommState, SetCommTimeouts, COMMTIMEOUTS, COMSTAT,
    DCB, EVENPARITY, FILE_FLAG_OVERLAPPED, INFINITE, MARKPARITY, NOPARITY, ODDPARITY, ONE5STOPBITS,
    ONESTOPBIT, PURGE_RXCLEAR, PURGE_TXCLEAR, SPACEPARITY, TWOSTOPBITS, WAIT_FAILED, WAIT_OBJECT_0,
};
use winapi::um::winnt::{GENERIC_READ, GENERIC_WRITE, HANDLE};

use crate::config::{BaudRate, DataBits, Parity, SerialConfig, StopBits, Timeout};
use crate::error::{Error, Result};
use crate::sys::RawPort;

pub(crate) struct ComPort {
    handle: HANDLE,
    shutdown: HANDLE,
    /// Last COMMTIMEOUTS profile pushed to the driver, to skip redundant
    /// `SetCommTimeouts` calls on every read.
    applied_timeout: Mutex<Option<Timeout>>,
    released: AtomicBool,
}

// Raw HANDLEs; all mutation is either atomic or behind the mutex, and the
// engine serializes release against in-flight I/O.
unsafe impl Send for ComPort {}
unsafe impl Sync for ComPort {}

/// Auto-closing wrapper for per-operation event handles.
struct OwnedEvent(HANDLE);

impl OwnedEvent {
    fn new(manual_reset: bool) -> Result<Self> {
        let handle = unsafe {
            CreateEventW(
                ptr::null_mut(),
                if manual_reset { TRUE } else { FALSE },
                FALSE,
                ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(Error::Driver(last_error()));
        }
        Ok(Self(handle))
    }

    fn into_raw(self) -> HANDLE {
        let handle = self.0;
        mem::forget(self);
        handle
    }
}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// COM devices beyond COM9 need the `\\.\` device-path prefix; applying it
/// unconditionally is valid for all of them.
fn to_device_path(name: &str) -> Vec<u16> {
    let full = if name.starts_with("\\\\") {
        name.to_string()
    } else {
        format!(r"\\.\{name}")
    };
    std::ffi::OsStr::new(&full)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn blank_dcb() -> DCB {
    let mut dcb: DCB = unsafe { mem::zeroed() };
    dcb.DCBlength = mem::size_of::<DCB>() as DWORD;
    dcb
}

impl ComPort {
    pub(crate) fn open(name: &str) -> Result<Self> {
        let path = to_device_path(name);
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0, // no sharing: exclusive access
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::from_open(name, last_error()));
        }

        // Rejects handles that are not comm devices before any I/O happens.
        let mut dcb = blank_dcb();
        if unsafe { GetCommState(handle, &mut dcb) } == 0 {
            let err = last_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::from_open(name, err));
        }

        let shutdown = match OwnedEvent::new(true) {
            Ok(event) => event,
            Err(err) => {
                unsafe { CloseHandle(handle) };
                return Err(err);
            }
        };

        let port = Self {
            handle,
            shutdown: shutdown.into_raw(),
            applied_timeout: Mutex::new(None),
            released: AtomicBool::new(false),
        };

        // Establish deterministic timeouts up front; the driver may have
        // inherited arbitrary values from a previous owner.
        port.apply_read_timeout(Timeout::Infinite)?;
        Ok(port)
    }

    fn apply_read_timeout(&self, timeout: Timeout) -> Result<()> {
        let mut cached = self.applied_timeout.lock();
        if *cached == Some(timeout) {
            return Ok(());
        }

        // Write side is always plain blocking; only reads are governed.
        let mut timeouts = COMMTIMEOUTS {
            ReadIntervalTimeout: 0,
            ReadTotalTimeoutMultiplier: 0,
            ReadTotalTimeoutConstant: 0,
            WriteTotalTimeoutMultiplier: 0,
            WriteTotalTimeoutConstant: 0,
        };
        match timeout {
            // Return at once with whatever is buffered.
            Timeout::Immediate => {
                timeouts.ReadIntervalTimeout = DWORD::MAX;
            }
            // Documented special case: return as soon as one byte arrives or
            // the constant elapses. MAXDWORD itself is reserved, hence the
            // clamp.
            Timeout::Milliseconds(ms) => {
                timeouts.ReadIntervalTimeout = DWORD::MAX;
                timeouts.ReadTotalTimeoutMultiplier = DWORD::MAX;
                timeouts.ReadTotalTimeoutConstant = ms.min(DWORD::MAX - 1);
            }
            // Same first-byte semantics with a ~49 day constant; the read
            // loop reissues on the rare zero-byte expiry.
            Timeout::Infinite => {
                timeouts.ReadIntervalTimeout = DWORD::MAX;
                timeouts.ReadTotalTimeoutMultiplier = DWORD::MAX;
                timeouts.ReadTotalTimeoutConstant = DWORD::MAX - 1;
            }
        }

        if unsafe { SetCommTimeouts(self.handle, &mut timeouts) } == 0 {
            return Err(Error::Driver(last_error()));
        }
        *cached = Some(timeout);
        Ok(())
    }

    /// Wait for an issued overlapped operation or the shutdown event,
    /// whichever fires first, and collect the transferred byte count.
    fn wait_overlapped(&self, ov: &mut OVERLAPPED) -> Result<DWORD> {
        let events = [ov.hEvent, self.shutdown];
        let status = unsafe { WaitForMultipleObjects(2, events.as_ptr(), FALSE, INFINITE) };

        if status == WAIT_OBJECT_0 + 1 {
            // Closed from another thread: cancel and reap the operation so
            // the kernel is done with `ov` before it goes out of scope.
            unsafe {
                CancelIoEx(self.handle, ov);
                let mut transferred: DWORD = 0;
                GetOverlappedResult(self.handle, ov, &mut transferred, TRUE);
            }
            return Err(Error::ClosedPort);
        }
        if status == WAIT_FAILED {
            return Err(Error::Driver(last_error()));
        }

        let mut transferred: DWORD = 0;
        if unsafe { GetOverlappedResult(self.handle, ov, &mut transferred, TRUE) } == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_OPERATION_ABORTED {
                return Err(Error::ClosedPort);
            }
            return Err(Error::Driver(io::Error::from_raw_os_error(code as i32)));
        }
        Ok(transferred)
    }

    fn fetch_dcb(&self) -> Result<DCB> {
        let mut dcb = blank_dcb();
        if unsafe { GetCommState(self.handle, &mut dcb) } == 0 {
            return Err(Error::Driver(last_error()));
        }
        Ok(dcb)
    }
}

impl RawPort for ComPort {
    fn read_with_timeout(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.apply_read_timeout(timeout)?;
        let len = buf.len().min(DWORD::MAX as usize) as DWORD;

        loop {
            let event = OwnedEvent::new(false)?;
            let mut ov: OVERLAPPED = unsafe { mem::zeroed() };
            ov.hEvent = event.0;

            let issued =
                unsafe { ReadFile(self.handle, buf.as_mut_ptr().cast(), len, ptr::null_mut(), &mut ov) };
            if issued == 0 {
                let code = unsafe { GetLastError() };
                if code != ERROR_IO_PENDING {
                    return Err(Error::Driver(io::Error::from_raw_os_error(code as i32)));
                }
            }

            let n = self.wait_overlapped(&mut ov)?;
            if n > 0 || timeout != Timeout::Infinite {
                return Ok(n as usize);
            }
            // Infinite mode: the jumbo timeout constant expired with no data.
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let len = buf.len().min(DWORD::MAX as usize) as DWORD;

        let event = OwnedEvent::new(false)?;
        let mut ov: OVERLAPPED = unsafe { mem::zeroed() };
        ov.hEvent = event.0;

        let issued =
            unsafe { WriteFile(self.handle, buf.as_ptr().cast(), len, ptr::null_mut(), &mut ov) };
        if issued == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_IO_PENDING {
                return Err(Error::Driver(io::Error::from_raw_os_error(code as i32)));
            }
        }

        let n = self.wait_overlapped(&mut ov)?;
        Ok(n as usize)
    }

    fn native_config(&self) -> Result<SerialConfig> {
        decode(&self.fetch_dcb()?)
    }

    fn set_native_config(&self, config: &SerialConfig) -> Result<()> {
        let mut dcb = self.fetch_dcb()?;
        encode_into(config, &mut dcb);
        if unsafe { SetCommState(self.handle, &mut dcb) } == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_INVALID_PARAMETER {
                return Err(Error::unsupported(config.to_string()));
            }
            return Err(Error::Driver(io::Error::from_raw_os_error(code as i32)));
        }
        // Some drivers accept SetCommState and silently substitute values;
        // read back so the caller sees the rejection instead.
        let applied = decode(&self.fetch_dcb()?)?;
        if applied != *config {
            return Err(Error::unsupported(format!(
                "driver rejected {config}, active configuration is {applied}"
            )));
        }
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<usize> {
        let mut errors: DWORD = 0;
        let mut status: COMSTAT = unsafe { mem::zeroed() };
        if unsafe { ClearCommError(self.handle, &mut errors, &mut status) } == 0 {
            return Err(Error::Driver(last_error()));
        }
        Ok(status.cbInQue as usize)
    }

    fn discard_buffers(&self) -> Result<()> {
        if unsafe { PurgeComm(self.handle, PURGE_RXCLEAR | PURGE_TXCLEAR) } == 0 {
            return Err(Error::Driver(last_error()));
        }
        Ok(())
    }

    fn wake(&self) {
        unsafe { SetEvent(self.shutdown) };
    }

    fn close_native(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in [self.handle, self.shutdown] {
            if unsafe { CloseHandle(handle) } == 0 {
                tracing::warn!(
                    error = %last_error(),
                    "ignoring error while releasing serial handle"
                );
            }
        }
    }
}

impl Drop for ComPort {
    fn drop(&mut self) {
        self.close_native();
    }
}

// ===== configuration codec =====

/// Encode a configuration into an existing DCB snapshot. Every enum member
/// has a DCB encoding; combinations a given driver cannot do are rejected by
/// `SetCommState`, which is why rejection is reported at apply time.
fn encode_into(config: &SerialConfig, dcb: &mut DCB) {
    dcb.BaudRate = config.baud_rate.bits_per_second();
    dcb.ByteSize = config.data_bits.bit_count();
    dcb.set_fBinary(1);
    dcb.set_fParity(if config.parity == Parity::None { 0 } else { 1 });
    dcb.Parity = match config.parity {
        Parity::None => NOPARITY,
        Parity::Odd => ODDPARITY,
        Parity::Even => EVENPARITY,
        Parity::Mark => MARKPARITY,
        Parity::Space => SPACEPARITY,
    } as u8;
    dcb.StopBits = match config.stop_bits {
        StopBits::One => ONESTOPBIT,
        StopBits::OneAndHalf => ONE5STOPBITS,
        StopBits::Two => TWOSTOPBITS,
    } as u8;
}

/// Decode the four framing parameters out of a DCB snapshot.
fn decode(dcb: &DCB) -> Result<SerialConfig> {
    let baud_rate = BaudRate::from_bits_per_second(dcb.BaudRate).ok_or_else(|| {
        Error::unsupported(format!(
            "baud rate {} is not a representable rate",
            dcb.BaudRate
        ))
    })?;

    let data_bits = match dcb.ByteSize {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => {
            return Err(Error::unsupported(format!(
                "unrecognized byte size {other}"
            )));
        }
    };

    let parity = match DWORD::from(dcb.Parity) {
        NOPARITY => Parity::None,
        ODDPARITY => Parity::Odd,
        EVENPARITY => Parity::Even,
        MARKPARITY => Parity::Mark,
        SPACEPARITY => Parity::Space,
        other => {
            return Err(Error::unsupported(format!(
                "unrecognized parity constant {other}"
            )));
        }
    };

    let stop_bits = match DWORD::from(dcb.StopBits) {
        ONESTOPBIT => StopBits::One,
        ONE5STOPBITS => StopBits::OneAndHalf,
        TWOSTOPBITS => StopBits::Two,
        other => {
            return Err(Error::unsupported(format!(
                "unrecognized stop bits constant {other}"
            )));
        }
    };

    Ok(SerialConfig {
        baud_rate,
        parity,
        stop_bits,
        data_bits,
    })
}
