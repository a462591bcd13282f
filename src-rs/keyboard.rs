//! Raw evdev keyboard input (`/dev/input/event*`).

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::Read;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

/// Linux KEY_R.
pub const DEFAULT_SETREF_KEY: u16 = 19;

const EV_KEY: u16 = 0x01;
const KEY_PRESS: i32 = 1;
// _IOW('E', 0x90, int)
const EVIOCGRAB: libc::c_ulong = 0x4004_4590;

const EVENT_SIZE: usize = size_of::<libc::input_event>();
const TYPE_OFFSET: usize = size_of::<libc::timeval>();

/// Key codes of every key-press record in `buf`. Trailing partial records
/// are ignored; repeats (value 2) and releases (value 0) are skipped.
pub fn parse_key_presses(buf: &[u8]) -> Vec<u16> {
    buf.chunks_exact(EVENT_SIZE)
        .filter_map(|record| {
            let kind = u16::from_ne_bytes([record[TYPE_OFFSET], record[TYPE_OFFSET + 1]]);
            let code = u16::from_ne_bytes([record[TYPE_OFFSET + 2], record[TYPE_OFFSET + 3]]);
            let value = i32::from_ne_bytes([
                record[TYPE_OFFSET + 4],
                record[TYPE_OFFSET + 5],
                record[TYPE_OFFSET + 6],
                record[TYPE_OFFSET + 7],
            ]);
            (kind == EV_KEY && value == KEY_PRESS).then_some(code)
        })
        .collect()
}

/// An opened input device. Dropping or [`KeyboardDevice::release`] gives up
/// the exclusive grab.
#[derive(Debug)]
pub struct KeyboardDevice {
    path: PathBuf,
    file: Option<File>,
    grabbed: bool,
}

impl KeyboardDevice {
    pub fn open(path: &Path, grab: bool) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open keyboard device: {}", path.display()))?;
        let mut device = Self {
            path: path.to_path_buf(),
            file: Some(file),
            grabbed: false,
        };
        if grab {
            device.set_grab(true)?;
        }
        info!(device = %path.display(), grabbed = device.grabbed, "keyboard device opened");
        Ok(device)
    }

    /// Reads key presses on a background thread and hands each key code to
    /// `forward` until it returns false or the device goes away.
    pub fn spawn_reader<F>(&self, mut forward: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnMut(u16) -> bool + Send + 'static,
    {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| anyhow!("keyboard device already released"))?;
        let mut reader = file
            .try_clone()
            .with_context(|| format!("failed to clone keyboard handle: {}", self.path.display()))?;
        let path = self.path.clone();

        Ok(thread::spawn(move || {
            let mut buf = vec![0u8; EVENT_SIZE * 64];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(device = %path.display(), error = %err, "keyboard read error");
                        break;
                    }
                };
                for code in parse_key_presses(&buf[..n]) {
                    if !forward(code) {
                        return;
                    }
                }
            }
            debug!(device = %path.display(), "keyboard reader stopped");
        }))
    }

    /// Releases the grab and closes the handle. Safe to call twice.
    pub fn release(&mut self) {
        if self.grabbed {
            if let Err(err) = self.set_grab(false) {
                warn!(device = %self.path.display(), error = %err, "failed to release keyboard grab");
            }
        }
        if self.file.take().is_some() {
            info!(device = %self.path.display(), "keyboard device released");
        }
    }

    fn set_grab(&mut self, grab: bool) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| anyhow!("keyboard device already released"))?;
        let flag: libc::c_int = i32::from(grab);
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), EVIOCGRAB as _, flag) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("EVIOCGRAB failed on {}", self.path.display()));
        }
        self.grabbed = grab;
        Ok(())
    }
}

impl Drop for KeyboardDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn record(kind: u16, code: u16, value: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; TYPE_OFFSET];
        bytes.extend_from_slice(&kind.to_ne_bytes());
        bytes.extend_from_slice(&code.to_ne_bytes());
        bytes.extend_from_slice(&value.to_ne_bytes());
        bytes.resize(EVENT_SIZE, 0);
        bytes
    }

    #[test]
    fn picks_key_presses_only() {
        let mut buf = Vec::new();
        buf.extend(record(EV_KEY, 19, 1));
        buf.extend(record(EV_KEY, 19, 0));
        buf.extend(record(EV_KEY, 30, 2));
        buf.extend(record(0x04, 4, 458_773));
        buf.extend(record(EV_KEY, 30, 1));
        assert_eq!(parse_key_presses(&buf), vec![19, 30]);
    }

    #[test]
    fn ignores_partial_trailing_record() {
        let mut buf = record(EV_KEY, 2, 1);
        buf.extend_from_slice(&record(EV_KEY, 3, 1)[..EVENT_SIZE / 2]);
        assert_eq!(parse_key_presses(&buf), vec![2]);
    }

    #[test]
    fn reader_forwards_codes_from_device_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&record(EV_KEY, 19, 1)).unwrap();
        file.write_all(&record(EV_KEY, 44, 1)).unwrap();
        file.flush().unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut device = KeyboardDevice::open(file.path(), false).unwrap();
        let handle = device
            .spawn_reader(move |code| tx.send(code).is_ok())
            .unwrap();
        handle.join().unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![19, 44]);
        device.release();
        device.release();
        assert!(device.spawn_reader(|_| true).is_err());
    }

    #[test]
    fn open_missing_device_fails() {
        assert!(KeyboardDevice::open(Path::new("/nonexistent/event9"), false).is_err());
    }
}
