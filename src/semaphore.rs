// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process counting semaphore. Used by the Windows condition
// variable emulation and by the in-process async-io transport as a
// wakeup primitive (see asyncio::inproc).

use std::io;

/// A named, inter-process counting semaphore.
pub struct IpcSemaphore {
    #[cfg(unix)]
    inner: posix_sem::PosixSemaphore,
    #[cfg(windows)]
    inner: windows_sem::WindowsSemaphore,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        #[cfg(unix)]
        let inner = posix_sem::PosixSemaphore::open(name, initial)?;
        #[cfg(windows)]
        let inner = windows_sem::WindowsSemaphore::open(name, initial)?;
        Ok(Self { inner })
    }

    /// Decrement the count, blocking until available or `timeout_ms` elapses.
    /// `None` blocks indefinitely. Returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Increment the count by `n`, waking up to `n` waiters.
    pub fn post(&self, n: u32) -> io::Result<()> {
        self.inner.post(n)
    }

    /// Remove the backing storage for a named semaphore.
    pub fn clear_storage(name: &str) {
        #[cfg(unix)]
        posix_sem::PosixSemaphore::clear_storage(name);
        #[cfg(windows)]
        {
            let _ = name;
        }
    }
}

#[cfg(unix)]
mod posix_sem {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    pub struct PosixSemaphore {
        sem: *mut libc::sem_t,
        name: CString,
    }

    unsafe impl Send for PosixSemaphore {}
    unsafe impl Sync for PosixSemaphore {}

    impl PosixSemaphore {
        pub fn open(name: &str, initial: u32) -> io::Result<Self> {
            let cname = CString::new(crate::shm_name::make_shm_name(name)).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            })?;
            let sem = unsafe {
                libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT,
                    0o600 as libc::mode_t,
                    initial,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { sem, name: cname })
        }

        pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
            match timeout_ms {
                None => {
                    let ret = unsafe { libc::sem_wait(self.sem) };
                    if ret != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(true)
                }
                Some(ms) => {
                    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
                    ts.tv_sec += (ms / 1000) as libc::time_t;
                    ts.tv_nsec += ((ms % 1000) * 1_000_000) as libc::c_long;
                    if ts.tv_nsec >= 1_000_000_000 {
                        ts.tv_sec += 1;
                        ts.tv_nsec -= 1_000_000_000;
                    }
                    let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
                    if ret == 0 {
                        return Ok(true);
                    }
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::TimedOut
                        || err.raw_os_error() == Some(libc::ETIMEDOUT)
                    {
                        return Ok(false);
                    }
                    Err(err)
                }
            }
        }

        pub fn post(&self, n: u32) -> io::Result<()> {
            for _ in 0..n {
                if unsafe { libc::sem_post(self.sem) } != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn clear_storage(name: &str) {
            if let Ok(cname) = CString::new(crate::shm_name::make_shm_name(name)) {
                unsafe { libc::sem_unlink(cname.as_ptr()) };
            }
        }
    }

    impl Drop for PosixSemaphore {
        fn drop(&mut self) {
            if !self.sem.is_null() && self.sem != ptr::null_mut() {
                unsafe { libc::sem_close(self.sem) };
            }
        }
    }
}

#[cfg(windows)]
mod windows_sem {
    use super::*;
    use std::ptr;

    pub struct WindowsSemaphore {
        handle: windows_sys::Win32::Foundation::HANDLE,
    }

    unsafe impl Send for WindowsSemaphore {}
    unsafe impl Sync for WindowsSemaphore {}

    impl WindowsSemaphore {
        pub fn open(name: &str, initial: u32) -> io::Result<Self> {
            use windows_sys::Win32::System::Threading::CreateSemaphoreW;
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let handle = unsafe {
                CreateSemaphoreW(ptr::null(), initial as i32, i32::MAX, wide.as_ptr())
            };
            if handle == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle })
        }

        pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
            use windows_sys::Win32::System::Threading::*;
            let millis = timeout_ms.map(|m| m as u32).unwrap_or(u32::MAX);
            let ret = unsafe { WaitForSingleObject(self.handle, millis) };
            match ret {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(io::Error::last_os_error()),
            }
        }

        pub fn post(&self, n: u32) -> io::Result<()> {
            use windows_sys::Win32::System::Threading::ReleaseSemaphore;
            if unsafe { ReleaseSemaphore(self.handle, n as i32, ptr::null_mut()) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for WindowsSemaphore {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }
}
