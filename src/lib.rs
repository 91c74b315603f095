//! # spellhook
//!
//! This library implements a runtime instrumentation layer for a game's
//! spell ("magic") system. It hooks the engine's spell-data execution to
//! inject, override and suppress property calls live, synthesizes whole
//! spell casts with correctly-resolved actors and targets, and patches the
//! proprietary binary spell-definition files in memory so changes persist
//! across every reload.
//!
//! The interesting machinery is platform-pure and lives in [`magic`]:
//!
//! - [`magic::MagicBuilder`] accumulates a deduplicated modification set
//!   for one spell and round-trips it through a JSON document.
//! - [`magic::MagicProcessor`] is the interception state machine that makes
//!   the live execution stream look as if the spell file contained the
//!   requested changes.
//! - [`magic::CastingEngine`] casts spells the engine never asked for.
//! - [`magic::MagicWriter`] patches spell files on load, persistently.
//!
//! The Windows-only glue in [`engine::hooks`] wires those pieces to the
//! live engine through [MinHook](crate::mh).
//!
//! ## Fair warning
//!
//! The hook layer contains a hefty amount of FFI and `unsafe` code driven
//! by reverse engineered layouts. It is built to degrade gracefully (a
//! failed lookup passes the engine call through untouched), but it can
//! still crash the host application.
//!
//! ## Usage
//!
//! Compile your crate as a `cdylib`, resolve the engine addresses with
//! your favorite scanner, and hand everything to the builder:
//!
//! ```no_run
//! # #[cfg(windows)] {
//! use std::sync::Arc;
//!
//! use spellhook::engine::raw::EngineAddresses;
//! use spellhook::magic::{MagicBuilder, ModValue, SourceSelector, TargetSelector};
//!
//! # let (addresses, actors, resources): (EngineAddresses, Arc<dyn spellhook::magic::ActorPort>, Arc<dyn spellhook::magic::ResourcePort>) = todo!();
//! spellhook::Spellhook::builder()
//!     .with_engine(addresses, actors, resources)
//!     .build()
//!     .apply()
//!     .unwrap();
//!
//! let casting = spellhook::engine::hooks::casting_engine().unwrap();
//! let mut builder = MagicBuilder::new(214);
//! builder
//!     .remove_operation(4338, 1)
//!     .add_operation(4338, 2493, [(187, ModValue::Int(2))], -1)
//!     .cast(&casting, SourceSelector::Auto, TargetSelector::Auto);
//! # }
//! ```
pub use tracing;
#[cfg(windows)]
pub use windows;

pub mod engine;
pub mod magic;
#[cfg(windows)]
pub mod mh;
pub mod util;

#[cfg(windows)]
pub use lifecycle::*;

#[cfg(windows)]
mod lifecycle {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use tracing::error;
    use windows::core::Error;
    use windows::Win32::Foundation::HINSTANCE;
    use windows::Win32::System::Console::{
        AllocConsole, FreeConsole, GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_OUTPUT_HANDLE,
    };
    use windows::Win32::System::LibraryLoader::FreeLibraryAndExitThread;

    use crate::engine::hooks::SpellHooks;
    use crate::engine::raw::EngineAddresses;
    use crate::magic::casting::ActorPort;
    use crate::magic::writer::ResourcePort;
    use crate::mh::MH_STATUS;

    // Global state objects.
    static MODULE: OnceCell<isize> = OnceCell::new();
    static SPELLHOOK: OnceCell<Mutex<Option<Spellhook>>> = OnceCell::new();
    static CONSOLE_ALLOCATED: AtomicBool = AtomicBool::new(false);

    /// Allocate a Windows console.
    pub fn alloc_console() -> Result<(), Error> {
        if !CONSOLE_ALLOCATED.swap(true, Ordering::SeqCst) {
            unsafe { AllocConsole()? };
        }

        Ok(())
    }

    /// Enable console colors if the console is allocated.
    pub fn enable_console_colors() {
        if CONSOLE_ALLOCATED.load(Ordering::SeqCst) {
            unsafe {
                let stdout_handle = GetStdHandle(STD_OUTPUT_HANDLE).unwrap();

                let mut console_mode = CONSOLE_MODE(0);
                GetConsoleMode(stdout_handle, &mut console_mode).unwrap();

                console_mode.0 |= ENABLE_VIRTUAL_TERMINAL_PROCESSING.0;

                SetConsoleMode(stdout_handle, console_mode).unwrap();
            }
        }
    }

    /// Free the previously allocated Windows console.
    pub fn free_console() -> Result<(), Error> {
        if CONSOLE_ALLOCATED.swap(false, Ordering::SeqCst) {
            unsafe { FreeConsole()? };
        }

        Ok(())
    }

    /// Disable the hooks and eject the DLL.
    ///
    /// Frees the console (if one was allocated), unapplies every detour and
    /// invokes
    /// [`windows::Win32::System::LibraryLoader::FreeLibraryAndExitThread`].
    /// Perform any manual cleanup before calling this.
    pub fn eject() {
        thread::spawn(|| unsafe {
            if let Err(e) = free_console() {
                error!("{e:?}");
            }

            if let Some(spellhook) = SPELLHOOK.get().and_then(|cell| cell.lock().take()) {
                if let Err(e) = spellhook.unapply() {
                    error!("Couldn't unapply hooks: {e:?}");
                }
            }

            if let Some(module) = MODULE.get() {
                FreeLibraryAndExitThread(HINSTANCE(*module), 0);
            }
        });
    }

    /// Holds the applied hook set and manages its lifetime.
    pub struct Spellhook {
        hooks: SpellHooks,
    }

    unsafe impl Send for Spellhook {}
    unsafe impl Sync for Spellhook {}

    impl Spellhook {
        /// Create a builder object.
        pub fn builder() -> SpellhookBuilder {
            SpellhookBuilder::default()
        }

        /// Apply the hooks and stash the instance for [`eject`].
        pub fn apply(self) -> Result<(), MH_STATUS> {
            unsafe { self.hooks.apply()? };

            SPELLHOOK.get_or_init(|| Mutex::new(None)).lock().replace(self);
            Ok(())
        }

        /// Disable and clean up the hooks.
        pub fn unapply(&self) -> Result<(), MH_STATUS> {
            unsafe { self.hooks.unapply() }
        }
    }

    /// Builder object for [`Spellhook`].
    #[derive(Default)]
    pub struct SpellhookBuilder {
        engine: Option<(EngineAddresses, Arc<dyn ActorPort>, Arc<dyn ResourcePort>)>,
    }

    impl SpellhookBuilder {
        /// Provide the resolved engine addresses and the game-specific
        /// actor and resource collaborators.
        pub fn with_engine(
            mut self,
            addresses: EngineAddresses,
            actors: Arc<dyn ActorPort>,
            resources: Arc<dyn ResourcePort>,
        ) -> Self {
            self.engine = Some((addresses, actors, resources));
            self
        }

        /// Save the DLL instance (for the [`eject`] method).
        pub fn with_hmodule(self, module: HINSTANCE) -> Self {
            MODULE.set(module.0).ok();
            self
        }

        /// Build the [`Spellhook`] object.
        pub fn build(self) -> Spellhook {
            let (addresses, actors, resources) =
                self.engine.expect("engine addresses not provided");

            let hooks = unsafe { SpellHooks::new(addresses, actors, resources) }
                .expect("couldn't create engine hooks");

            Spellhook { hooks }
        }
    }
}

/// Entry point generator for the library.
///
/// Invoke with an expression that builds a [`Spellhook`] to generate the
/// `DllMain` your payload needs:
///
/// ```no_run
/// # /*
/// spellhook::spellhook!(Spellhook::builder()
///     .with_engine(addresses, actors, resources)
///     .build());
/// # */
/// ```
#[macro_export]
#[cfg(windows)]
macro_rules! spellhook {
    ($spellhook:expr) => {
        /// Entry point created by the `spellhook` library.
        #[no_mangle]
        pub unsafe extern "stdcall" fn DllMain(
            hmodule: ::spellhook::windows::Win32::Foundation::HINSTANCE,
            reason: u32,
            _: *mut ::std::ffi::c_void,
        ) {
            if reason == ::spellhook::windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH {
                ::spellhook::tracing::trace!("DllMain()");
                ::std::thread::spawn(move || {
                    let spellhook = { $spellhook };
                    if let Err(e) = spellhook.apply() {
                        ::spellhook::tracing::error!("Couldn't apply hooks: {e:?}");
                        ::spellhook::eject();
                    }
                });
            }
        }
    };
}
