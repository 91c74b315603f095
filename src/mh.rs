//! Thin FFI wrapper around [`minhook`](https://github.com/TsudaKageyu/minhook),
//! the external hooking library every detour in this crate goes through.
//! Linking the MinHook static library is the embedding project's concern.
#![allow(dead_code, non_snake_case, non_camel_case_types, missing_docs)]

use std::ffi::c_void;
use std::ptr::null_mut;

use tracing::error;

#[allow(non_camel_case_types)]
#[must_use]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MH_STATUS {
    /// Unknown error. Should not be returned.
    MH_UNKNOWN = -1,
    /// Successful.
    MH_OK = 0,
    /// MinHook is already initialized.
    MH_ERROR_ALREADY_INITIALIZED,
    /// MinHook is not initialized yet, or already uninitialized.
    MH_ERROR_NOT_INITIALIZED,
    /// The hook for the specified target function is already created.
    MH_ERROR_ALREADY_CREATED,
    /// The hook for the specified target function is not created yet.
    MH_ERROR_NOT_CREATED,
    /// The hook for the specified target function is already enabled.
    MH_ERROR_ENABLED,
    /// The hook for the specified target function is not enabled yet, or
    /// already disabled.
    MH_ERROR_DISABLED,
    /// The specified pointer is invalid. It points the address of non-allocated
    /// and/or non-executable region.
    MH_ERROR_NOT_EXECUTABLE,
    /// The specified target function cannot be hooked.
    MH_ERROR_UNSUPPORTED_FUNCTION,
    /// Failed to allocate memory.
    MH_ERROR_MEMORY_ALLOC,
    /// Failed to change the memory protection.
    MH_ERROR_MEMORY_PROTECT,
    /// The specified module is not loaded.
    MH_ERROR_MODULE_NOT_FOUND,
    /// The specified function is not found.
    MH_ERROR_FUNCTION_NOT_FOUND,
}

extern "system" {
    pub fn MH_Initialize() -> MH_STATUS;
    pub fn MH_Uninitialize() -> MH_STATUS;
    pub fn MH_CreateHook(
        pTarget: *mut c_void,
        pDetour: *mut c_void,
        ppOriginal: *mut *mut c_void,
    ) -> MH_STATUS;
    pub fn MH_QueueEnableHook(pTarget: *mut c_void) -> MH_STATUS;
    pub fn MH_QueueDisableHook(pTarget: *mut c_void) -> MH_STATUS;
    pub fn MH_ApplyQueued() -> MH_STATUS;
}

impl MH_STATUS {
    pub fn ok_context(self, context: &str) -> Result<(), MH_STATUS> {
        if self == MH_STATUS::MH_OK {
            Ok(())
        } else {
            error!("{context}: {self:?}");
            Err(self)
        }
    }

    pub fn ok(self) -> Result<(), MH_STATUS> {
        if self == MH_STATUS::MH_OK {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// One installed hook: target address, detour, and the trampoline that
/// reaches the original code.
pub struct MhHook {
    addr: *mut c_void,
    hook_impl: *mut c_void,
    trampoline: *mut c_void,
}

impl MhHook {
    /// # Safety
    ///
    /// `addr` must be the entry of a hookable function and `hook_impl` a
    /// detour with an ABI-compatible signature.
    pub unsafe fn new(addr: *mut c_void, hook_impl: *mut c_void) -> Result<Self, MH_STATUS> {
        let mut trampoline = null_mut();
        MH_CreateHook(addr, hook_impl, &mut trampoline).ok_context("MH_CreateHook")?;

        Ok(Self { addr, hook_impl, trampoline })
    }

    pub fn trampoline(&self) -> *mut c_void {
        self.trampoline
    }

    unsafe fn queue_enable(&self) -> Result<(), MH_STATUS> {
        MH_QueueEnableHook(self.addr).ok_context("MH_QueueEnableHook")
    }

    unsafe fn queue_disable(&self) -> Result<(), MH_STATUS> {
        MH_QueueDisableHook(self.addr).ok_context("MH_QueueDisableHook")
    }
}

/// A batch of hooks enabled and disabled together through MinHook's queue
/// API, so the whole set flips atomically.
pub struct MhHooks(Vec<MhHook>);

impl MhHooks {
    /// Initialize MinHook if needed and wrap the given hooks.
    ///
    /// # Safety
    ///
    /// See [`MhHook::new`].
    pub unsafe fn new(hooks: impl IntoIterator<Item = MhHook>) -> Result<Self, MH_STATUS> {
        match MH_Initialize() {
            MH_STATUS::MH_OK | MH_STATUS::MH_ERROR_ALREADY_INITIALIZED => {},
            status => return Err(status),
        }
        Ok(MhHooks(hooks.into_iter().collect()))
    }

    /// # Safety
    ///
    /// Enables the detours. All their statics must be initialized first.
    pub unsafe fn apply(&self) -> Result<(), MH_STATUS> {
        for hook in &self.0 {
            hook.queue_enable()?;
        }
        MH_ApplyQueued().ok_context("MH_ApplyQueued")
    }

    /// # Safety
    ///
    /// Disables the detours. Callbacks still on the stack will return
    /// through the trampolines.
    pub unsafe fn unapply(&self) -> Result<(), MH_STATUS> {
        for hook in &self.0 {
            hook.queue_disable()?;
        }
        MH_ApplyQueued().ok_context("MH_ApplyQueued")?;
        MH_Uninitialize().ok_context("MH_Uninitialize")
    }
}
