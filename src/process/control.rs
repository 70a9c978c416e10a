/*!
OS capability behind process termination and liveness checks.

POSIX: graceful is SIGINT, forced is SIGKILL, liveness is signal 0 where
ESRCH means dead and EPERM means alive (the process exists but belongs to
someone else).
Windows: graceful is a CTRL_BREAK console event delivered by attaching to the
target's console, forced is TerminateProcess, liveness is a zero-timeout wait
on a SYNCHRONIZE handle.
*/
use std::io;
use std::process::Command;

pub trait ProcessControl: Send + Sync {
    fn graceful_terminate(&self, pid: u32) -> io::Result<()>;
    fn is_alive(&self, pid: u32) -> io::Result<bool>;
    fn force_kill(&self, pid: u32) -> io::Result<()>;
}

/// The running platform's implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemControl;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_UNICODE_ENVIRONMENT: u32 = 0x0000_0400;

/// Spawn without a console window, in a new process group so console events
/// can target the child alone. No-op elsewhere.
pub fn hide_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP | CREATE_UNICODE_ENVIRONMENT);
    }
    #[cfg(not(windows))]
    {
        let _ = cmd;
    }
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::io;

    fn to_pid(pid: u32) -> io::Result<Pid> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
        Ok(Pid::from_raw(raw))
    }

    fn errno_to_io(e: Errno) -> io::Error {
        io::Error::from_raw_os_error(e as i32)
    }

    impl super::ProcessControl for super::SystemControl {
        fn graceful_terminate(&self, pid: u32) -> io::Result<()> {
            kill(to_pid(pid)?, Signal::SIGINT).map_err(errno_to_io)
        }

        fn is_alive(&self, pid: u32) -> io::Result<bool> {
            match kill(to_pid(pid)?, None) {
                Ok(()) => Ok(true),
                Err(Errno::ESRCH) => Ok(false),
                Err(Errno::EPERM) => Ok(true),
                Err(e) => Err(errno_to_io(e)),
            }
        }

        fn force_kill(&self, pid: u32) -> io::Result<()> {
            match kill(to_pid(pid)?, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(errno_to_io(e)),
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::shared::winerror::{
        ERROR_ACCESS_DENIED, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, WAIT_TIMEOUT,
    };
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::WAIT_OBJECT_0;
    use winapi::um::wincon::{
        AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, ATTACH_PARENT_PROCESS,
        CTRL_BREAK_EVENT,
    };
    use winapi::um::winnt::{HANDLE, PROCESS_TERMINATE, SYNCHRONIZE};

    fn last_error() -> io::Error {
        io::Error::last_os_error()
    }

    /// Re-attaches to the parent's console when dropped.
    struct ReattachParent;

    impl Drop for ReattachParent {
        fn drop(&mut self) {
            unsafe {
                AttachConsole(ATTACH_PARENT_PROCESS);
            }
        }
    }

    struct OwnedHandle(HANDLE);

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn open(access: DWORD, pid: u32) -> Result<OwnedHandle, DWORD> {
        let h = unsafe { OpenProcess(access, FALSE, pid) };
        if h.is_null() {
            return Err(unsafe { GetLastError() });
        }
        Ok(OwnedHandle(h))
    }

    impl super::ProcessControl for super::SystemControl {
        fn graceful_terminate(&self, pid: u32) -> io::Result<()> {
            unsafe {
                if FreeConsole() == 0 && GetLastError() != ERROR_INVALID_HANDLE {
                    return Err(last_error());
                }
                let _reattach = ReattachParent;
                if AttachConsole(pid) == 0 && GetLastError() != ERROR_ACCESS_DENIED {
                    return Err(last_error());
                }
                if SetConsoleCtrlHandler(None, TRUE) == 0 {
                    return Err(last_error());
                }
                if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) == 0 {
                    return Err(last_error());
                }
            }
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> io::Result<bool> {
            let h = match open(SYNCHRONIZE, pid) {
                Ok(h) => h,
                Err(ERROR_INVALID_PARAMETER) => return Ok(false),
                Err(ERROR_ACCESS_DENIED) => return Ok(true),
                Err(code) => return Err(io::Error::from_raw_os_error(code as i32)),
            };
            match unsafe { WaitForSingleObject(h.0, 0) } {
                WAIT_OBJECT_0 => Ok(false),
                WAIT_TIMEOUT => Ok(true),
                other => Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("unexpected WaitForSingleObject status: {other}"),
                )),
            }
        }

        fn force_kill(&self, pid: u32) -> io::Result<()> {
            let h = match open(PROCESS_TERMINATE, pid) {
                Ok(h) => h,
                Err(ERROR_INVALID_PARAMETER) => return Ok(()),
                Err(code) => return Err(io::Error::from_raw_os_error(code as i32)),
            };
            if unsafe { TerminateProcess(h.0, 1) } == 0 {
                return Err(last_error());
            }
            Ok(())
        }
    }
}
