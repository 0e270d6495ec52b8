use super::{
    hostname, ActivityEvent, ActivityKind, ActivitySink, Platform, PlatformError, SystemInfo,
    WindowInfo,
};
use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::process::Command;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::ProcessStatus::K32GetModuleFileNameExW;
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetForegroundWindow, GetMessageW, GetWindowTextLengthW, GetWindowTextW,
    GetWindowThreadProcessId, IsWindowVisible, PostThreadMessageW, SetWindowsHookExW,
    UnhookWindowsHookEx, MSG, WH_KEYBOARD_LL, WH_MOUSE_LL, WM_KEYDOWN, WM_LBUTTONDOWN,
    WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT, WM_RBUTTONDOWN,
};

const PROCESS_PATH_CAPACITY: usize = 260;

/// Process-wide hook state. Low-level hook procedures carry no context
/// pointer, so the sink and handles live here. Hook callbacks take this lock
/// briefly, read `stopped` and the sink, and release it before dispatching.
struct HookState {
    sink: Option<ActivitySink>,
    stopped: bool,
    installed: bool,
    mouse_hook: isize,
    keyboard_hook: isize,
    pump_thread_id: u32,
}

static HOOK_STATE: Lazy<Mutex<HookState>> = Lazy::new(|| {
    Mutex::new(HookState {
        sink: None,
        stopped: false,
        installed: false,
        mouse_hook: 0,
        keyboard_hook: 0,
        pump_thread_id: 0,
    })
});

pub struct WindowsPlatform {
    pump_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        Self {
            pump_thread: Mutex::new(None),
        }
    }
}

impl Platform for WindowsPlatform {
    fn active_window(&self) -> Result<WindowInfo> {
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd == 0 {
            return Err(PlatformError::NoForegroundWindow.into());
        }

        let length = unsafe { GetWindowTextLengthW(hwnd) };
        if length == 0 {
            // A transient or chromeless window; report it rather than erroring
            // so the tracker sees the focus change.
            return Ok(WindowInfo {
                title: String::new(),
                application: String::new(),
                process_id: 0,
                process_path: String::new(),
                is_visible: true,
                timestamp: Utc::now(),
            });
        }

        let mut buf = vec![0u16; length as usize + 1];
        let copied = unsafe { GetWindowTextW(hwnd, buf.as_mut_ptr(), buf.len() as i32) };
        let title = String::from_utf16_lossy(&buf[..copied.max(0) as usize]);

        let mut process_id: u32 = 0;
        unsafe { GetWindowThreadProcessId(hwnd, &mut process_id) };

        let process_path = process_path(process_id);
        let application = application_name(&process_path);
        let is_visible = unsafe { IsWindowVisible(hwnd) } != 0;

        Ok(WindowInfo {
            title,
            application,
            process_id,
            process_path,
            is_visible,
            timestamp: Utc::now(),
        })
    }

    fn start_input_monitoring(&self, sink: ActivitySink) -> Result<()> {
        {
            let mut state = HOOK_STATE.lock().expect("hook state mutex poisoned");
            if state.installed {
                panic!("input hooks already installed");
            }
            state.sink = Some(sink);
            state.stopped = false;
            state.installed = true;
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("input-hooks".into())
            .spawn(move || pump_messages(ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *self.pump_thread.lock().expect("pump thread mutex poisoned") = Some(handle);
                debug!("Input hooks installed");
                Ok(())
            }
            Ok(Err(e)) => {
                let mut state = HOOK_STATE.lock().expect("hook state mutex poisoned");
                state.sink = None;
                state.installed = false;
                let _ = handle.join();
                Err(e.into())
            }
            Err(_) => {
                let mut state = HOOK_STATE.lock().expect("hook state mutex poisoned");
                state.sink = None;
                state.installed = false;
                Err(PlatformError::HookInstall("input").into())
            }
        }
    }

    fn stop_input_monitoring(&self) {
        let (mouse, keyboard, pump_thread_id) = {
            let mut state = HOOK_STATE.lock().expect("hook state mutex poisoned");
            if !state.installed {
                return;
            }
            state.stopped = true;
            state.sink = None;
            state.installed = false;
            let handles = (state.mouse_hook, state.keyboard_hook, state.pump_thread_id);
            state.mouse_hook = 0;
            state.keyboard_hook = 0;
            state.pump_thread_id = 0;
            handles
        };

        // Uninstall synchronously; the process cannot exit cleanly while the
        // hooks are live.
        unsafe {
            if mouse != 0 {
                UnhookWindowsHookEx(mouse);
            }
            if keyboard != 0 {
                UnhookWindowsHookEx(keyboard);
            }
            if pump_thread_id != 0 {
                PostThreadMessageW(pump_thread_id, WM_QUIT, 0, 0);
            }
        }

        if let Some(handle) = self
            .pump_thread
            .lock()
            .expect("pump thread mutex poisoned")
            .take()
        {
            if handle.join().is_err() {
                warn!("Input hook thread panicked during shutdown");
            }
        }

        // Let the OS drain in-flight hook callbacks before the image unloads.
        thread::sleep(Duration::from_millis(100));
    }

    fn device_identity(&self) -> Result<String> {
        if let Some(uuid) = wmic_value(&["csproduct", "get", "uuid"], "UUID", 10) {
            return Ok(uuid);
        }
        if let Some(serial) = wmic_value(&["bios", "get", "serialnumber"], "SerialNumber", 3) {
            return Ok(serial);
        }
        let host = hostname();
        if !host.is_empty() {
            return Ok(format!("windows-{host}"));
        }
        Ok("unknown-device".to_string())
    }

    fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            os: "windows",
            os_version: sysinfo::System::os_version().unwrap_or_default(),
            arch: std::env::consts::ARCH,
            hostname: hostname(),
        })
    }

    fn open_browser(&self, url: &str) -> Result<()> {
        // The empty argument is the window title slot cmd.exe expects.
        Command::new("cmd").args(["/c", "start", "", url]).spawn()?;
        Ok(())
    }
}

fn pump_messages(ready_tx: mpsc::Sender<std::result::Result<(), PlatformError>>) {
    unsafe {
        let mouse = SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook_proc), 0, 0);
        if mouse == 0 {
            let _ = ready_tx.send(Err(PlatformError::HookInstall("mouse")));
            return;
        }
        let keyboard = SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), 0, 0);
        if keyboard == 0 {
            UnhookWindowsHookEx(mouse);
            let _ = ready_tx.send(Err(PlatformError::HookInstall("keyboard")));
            return;
        }

        {
            let mut state = HOOK_STATE.lock().expect("hook state mutex poisoned");
            state.mouse_hook = mouse;
            state.keyboard_hook = keyboard;
            state.pump_thread_id = GetCurrentThreadId();
        }
        let _ = ready_tx.send(Ok(()));

        // Low-level hooks deliver through this thread's message queue.
        let mut msg: MSG = std::mem::zeroed();
        while GetMessageW(&mut msg, 0, 0, 0) > 0 {}
    }
}

unsafe extern "system" fn mouse_hook_proc(code: i32, wparam: usize, lparam: isize) -> isize {
    if code >= 0 {
        let dispatch = {
            let state = HOOK_STATE.lock().expect("hook state mutex poisoned");
            if state.stopped {
                None
            } else {
                let kind = match wparam as u32 {
                    WM_MOUSEMOVE | WM_MOUSEWHEEL => Some(ActivityKind::MouseMove),
                    WM_LBUTTONDOWN | WM_RBUTTONDOWN => Some(ActivityKind::MouseClick),
                    _ => None,
                };
                kind.and_then(|k| state.sink.clone().map(|s| (s, k)))
            }
        };
        if let Some((sink, kind)) = dispatch {
            sink(ActivityEvent {
                kind,
                timestamp: Utc::now(),
            });
        }
    }
    unsafe { CallNextHookEx(0, code, wparam, lparam) }
}

unsafe extern "system" fn keyboard_hook_proc(code: i32, wparam: usize, lparam: isize) -> isize {
    if code >= 0 && wparam as u32 == WM_KEYDOWN {
        let dispatch = {
            let state = HOOK_STATE.lock().expect("hook state mutex poisoned");
            if state.stopped {
                None
            } else {
                state.sink.clone()
            }
        };
        if let Some(sink) = dispatch {
            sink(ActivityEvent {
                kind: ActivityKind::KeyPress,
                timestamp: Utc::now(),
            });
        }
    }
    unsafe { CallNextHookEx(0, code, wparam, lparam) }
}

fn process_path(process_id: u32) -> String {
    if process_id == 0 {
        return String::new();
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, process_id);
        if handle == 0 {
            return String::new();
        }
        let mut buf = [0u16; PROCESS_PATH_CAPACITY];
        let len = K32GetModuleFileNameExW(handle, 0, buf.as_mut_ptr(), buf.len() as u32);
        CloseHandle(handle);
        if len == 0 {
            return String::new();
        }
        String::from_utf16_lossy(&buf[..len as usize])
    }
}

/// Basename of the process image with a trailing `.exe` removed. The
/// orchestrator lowercases; the probe reports what the OS gave it.
fn application_name(process_path: &str) -> String {
    if process_path.is_empty() {
        return String::new();
    }
    let base = process_path.rsplit('\\').next().unwrap_or(process_path);
    base.strip_suffix(".exe").unwrap_or(base).to_string()
}

fn wmic_value(args: &[&str], header: &str, min_len: usize) -> Option<String> {
    let output = Command::new("wmic").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && *line != header && line.len() > min_len)
        .map(str::to_string)
}
