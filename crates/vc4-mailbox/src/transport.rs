//! # Mailbox Transports
//!
//! A transport carries one property buffer to the firmware and back. The
//! firmware rewrites the buffer in place.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use vc4_core::{Error, Result};

/// Moves a property buffer to the firmware and back
pub trait Transport: Send + Sync {
    /// Exchange `buffer` in place
    fn exchange(&self, buffer: &mut [u32]) -> Result<()>;
}

/// `_IOWR(100, 0, char *)`: the property-channel ioctl of `/dev/vcio`
pub const IOCTL_MBOX_PROPERTY: libc::c_ulong = (3 << 30)
    | ((core::mem::size_of::<*mut libc::c_void>() as libc::c_ulong) << 16)
    | (100 << 8);

/// Property channel through the kernel's `/dev/vcio` character device
#[derive(Debug)]
pub struct VcioTransport {
    file: File,
}

impl VcioTransport {
    /// Open the mailbox device
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|e| {
            log::error!("cannot open {}: {}", path.display(), e);
            Error::DeviceNotAvailable
        })?;
        Ok(Self { file })
    }
}

impl Transport for VcioTransport {
    fn exchange(&self, buffer: &mut [u32]) -> Result<()> {
        let declared = buffer.first().copied().unwrap_or(0) as usize;
        if declared != buffer.len() * 4 {
            return Err(Error::InvalidValue);
        }

        // SAFETY: the buffer is writable and its declared size matches its
        // length, so the firmware stays within it.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                buffer.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if ret < 0 {
            log::error!("mailbox ioctl failed: {}", std::io::Error::last_os_error());
            return Err(Error::MailboxTransport);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_number() {
        let expected = if core::mem::size_of::<usize>() == 8 {
            0xC008_6400
        } else {
            0xC004_6400
        };
        assert_eq!(IOCTL_MBOX_PROPERTY, expected);
    }

    #[test]
    fn test_missing_device() {
        assert_eq!(
            VcioTransport::open(Path::new("/nonexistent/vcio")).err(),
            Some(Error::DeviceNotAvailable)
        );
    }
}
