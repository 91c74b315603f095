//! Assorted helpers for the hook layer.

use std::fs::File;
use std::path::Path;
#[cfg(windows)]
use std::path::PathBuf;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a `tracing` subscriber writing to stdout and, when a path is
/// given, to a log file. Respects `RUST_LOG`. Does nothing if a subscriber
/// is already installed.
pub fn setup_tracing(log_file: Option<&Path>) {
    let file_layer = log_file.and_then(|path| File::create(path).ok()).map(|file| {
        fmt::layer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_thread_ids(true))
        .with(file_layer)
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Path of the DLL this crate is linked into. Handy for placing log files
/// next to the injected payload.
#[cfg(windows)]
pub fn get_dll_path() -> Option<PathBuf> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let mut module = HMODULE(0);
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            PCWSTR(get_dll_path as *const u16),
            &mut module,
        )
        .ok()?;
    }

    let mut path = [0u16; 1024];
    let len = unsafe { GetModuleFileNameW(module, &mut path) } as usize;
    (len > 0).then(|| PathBuf::from(String::from_utf16_lossy(&path[..len])))
}
