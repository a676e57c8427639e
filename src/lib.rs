// lib.rs — DLL entry point for the otcbot in-process agent.
//
// When this DLL is injected into the game client via LoadLibraryA, DllMain
// fires with DLL_PROCESS_ATTACH. It installs the vectored exception handler,
// takes the single-instance mutex, and spawns a background worker thread
// that runs the pipe server + creature scanner until DLL_PROCESS_DETACH.
//
// Must be compiled as a 32-bit cdylib (i686-pc-windows-msvc).

#![allow(non_snake_case)]

// Compile-time guard: only allow 32-bit x86 builds
#[cfg(not(target_arch = "x86"))]
compile_error!("Build with i686-pc-windows-msvc (32-bit x86).");

mod courier;   // Window-procedure subclass, UI-thread message trampoline
mod diag;      // Memory/hook introspection commands
mod fault;     // Vectored exception handler, per-thread armed contexts
mod heapscan;  // Fallback creature scanner (VirtualQuery sweep + re-read)
mod hooks;     // Inline-hook caves on the XTEA encrypt and send-attack functions
mod locator;   // One-shot discovery of the creature map header
mod logger;    // Debug / crash / XTEA caller logs
mod offsets;   // Process-wide offset registry
mod pipe;      // Named-pipe command/event channel + scanner loop
mod process;   // Host-module introspection (base, PE sections)
mod saferead;  // Kernel-mediated memory reads (the only way host memory is read)
mod snapshot;  // Creature snapshot rows + staged publish buffer
mod stability; // Targeting suppression after faults / population jumps
mod targeting; // Attack orchestration across the pipe and UI threads
mod walker;    // In-order walk of the game's creature map

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use winapi::shared::minwindef::{BOOL, DWORD, HINSTANCE, LPVOID, TRUE};
use winapi::um::handleapi::CloseHandle;
use winapi::um::libloaderapi::DisableThreadLibraryCalls;
use winapi::um::processthreadsapi::CreateThread;
use winapi::um::synchapi::{CreateMutexA, ReleaseMutex, WaitForSingleObject};
use winapi::um::winnt::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

/// Flag to keep the worker thread alive. Cleared on DLL_PROCESS_DETACH.
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Worker thread handle, joined (2 s) on detach.
static WORKER_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Single-instance mutex handle.
static INSTANCE_MUTEX: AtomicUsize = AtomicUsize::new(0);

/// Background worker: owns the pipe server and the scanner loop.
/// Hooks, the window subclass and the exception handler outlive this
/// thread deliberately — they cannot be torn down while host threads
/// may still be executing them.
unsafe extern "system" fn worker(_: LPVOID) -> DWORD {
    logger::init();
    log::info!(
        "agent attached, module base 0x{:08X}",
        process::module_base()
    );

    pipe::serve(&RUNNING);

    log::info!("worker thread exiting");
    0
}

/// DLL entry point — called by Windows when the DLL is loaded/unloaded.
#[no_mangle]
pub unsafe extern "system" fn DllMain(
    hinst: HINSTANCE,
    reason: DWORD,
    _reserved: LPVOID,
) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            // Prevent DLL_THREAD_ATTACH/DETACH notifications (we don't need them)
            DisableThreadLibraryCalls(hinst);

            // Save the DLL's module handle (used for resolving the log paths)
            logger::set_install_dir(hinst as usize);

            // First-chance exception handler must be in place before any
            // scanning starts; it stays for the life of the process.
            fault::install_handler();

            let mutex = CreateMutexA(ptr::null_mut(), 0, b"otcbot_agent\0".as_ptr() as _);
            INSTANCE_MUTEX.store(mutex as usize, Ordering::Relaxed);

            RUNNING.store(true, Ordering::Release);
            let h = CreateThread(
                ptr::null_mut(), 0, Some(worker),
                ptr::null_mut(), 0, ptr::null_mut(),
            );
            WORKER_THREAD.store(h as usize, Ordering::Relaxed);
        }
        DLL_PROCESS_DETACH => {
            // Signal the worker to stop and give it 2 s to wind down the
            // session. Installed hooks and the window subclass persist —
            // removing code another thread may be executing is not safe.
            RUNNING.store(false, Ordering::Release);
            let h = WORKER_THREAD.swap(0, Ordering::Relaxed);
            if h != 0 {
                WaitForSingleObject(h as _, 2000);
                CloseHandle(h as _);
            }
            let mutex = INSTANCE_MUTEX.swap(0, Ordering::Relaxed);
            if mutex != 0 {
                ReleaseMutex(mutex as _);
                CloseHandle(mutex as _);
            }
        }
        _ => {}
    }
    TRUE
}
