use std::path::Path;

/// `C:\Program Files\App\app.exe` -> `app`.
pub fn app_name_from_image_path(image: &str) -> String {
    let file = image.rsplit(['\\', '/']).next().unwrap_or(image);
    Path::new(file)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file)
        .to_string()
}

#[cfg(windows)]
pub use win::{is_pid_running, process_image_path};

#[cfg(windows)]
mod win {
    use windows::core::PWSTR;
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_FORMAT,
        PROCESS_QUERY_LIMITED_INFORMATION,
    };

    pub fn is_pid_running(pid: u32) -> bool {
        let handle = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        if handle.is_invalid() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let ok = unsafe { GetExitCodeProcess(handle, &mut exit_code) }.is_ok();
        let _ = unsafe { CloseHandle(handle) };
        if !ok {
            return false;
        }
        exit_code == STILL_ACTIVE.0 as u32
    }

    pub fn process_image_path(pid: u32) -> Option<String> {
        unsafe {
            let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) {
                Ok(handle) => handle,
                Err(_) => return None,
            };
            if handle.is_invalid() {
                return None;
            }
            let mut buffer = vec![0u16; 512];
            let mut size: u32 = buffer.len() as u32;
            let ok = QueryFullProcessImageNameW(handle, PROCESS_NAME_FORMAT(0), PWSTR(buffer.as_mut_ptr()), &mut size)
                .is_ok();
            let _ = CloseHandle(handle);
            if !ok {
                return None;
            }
            Some(String::from_utf16_lossy(&buffer[..size as usize]))
        }
    }
}
