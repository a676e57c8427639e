// fault.rs — Armed try-regions backed by a vectored exception handler.
//
// The scanner races the game thread's mutations of its own containers, and
// the targeting path calls straight into game code; either can take an
// access violation through no bug of ours. Each of the two regions saves a
// thread context before its protected work; the handler, first in the
// vectored chain, rewrites the faulting thread's context back to that save
// point instead of letting the exception unwind through game frames that
// were never written to be unwound across.
//
// Arming and resuming are strictly per-thread: a fault on any other thread
// never touches a saved context.

use crate::{logger, process, snapshot, stability};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use winapi::um::errhandlingapi::AddVectoredExceptionHandler;
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::winnt::{CONTEXT, EXCEPTION_POINTERS, RtlCaptureContext};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

const CODE_ACCESS_VIOLATION: u32 = 0xC000_0005;
/// MSVC C++ throw ("msc" | 0xE0000000) — the game's Lua bridge raises these.
const CODE_MSVC_CPP: u32 = 0xE06D_7363;
const CODE_BREAKPOINT: u32 = 0x8000_0003;
const CODE_SINGLE_STEP: u32 = 0x8000_0004;
const CODE_GUARD_PAGE: u32 = 0x8000_0001;
const CODE_HEAP_CORRUPTION: u32 = 0xC000_0374;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Region {
    /// The scanner/pipe thread walking game containers.
    Scanner,
    /// Whichever thread is executing the targeting path (UI thread via the
    /// courier, or a game worker via the XTEA cave).
    Targeting,
}

struct FaultSlot {
    ctx: UnsafeCell<MaybeUninit<CONTEXT>>,
    armed: AtomicBool,
    faulted: AtomicBool,
    owner_tid: AtomicU32,
}

// The CONTEXT cell is only written by the owning thread while disarmed and
// only read by the handler on that same thread.
unsafe impl Sync for FaultSlot {}

impl FaultSlot {
    const fn new() -> Self {
        FaultSlot {
            ctx: UnsafeCell::new(MaybeUninit::uninit()),
            armed: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            owner_tid: AtomicU32::new(0),
        }
    }
}

static SCANNER: FaultSlot = FaultSlot::new();
static TARGETING: FaultSlot = FaultSlot::new();

fn slot(region: Region) -> &'static FaultSlot {
    match region {
        Region::Scanner => &SCANNER,
        Region::Targeting => &TARGETING,
    }
}

/// Run `f` under an armed fault context. Returns None if a recoverable
/// fault occurred inside `f`; the handler has already reset the armed flag
/// and recorded the fault for the stability heuristic.
///
/// On a fault the frames below this one are abandoned, not unwound: `f`
/// must not hold locks and should keep heap allocation out of the
/// protected work (the walker writes into preallocated row buffers for
/// exactly this reason).
#[inline(never)]
pub fn with_recovery<R>(region: Region, f: impl FnOnce() -> R) -> Option<R> {
    let s = slot(region);
    s.owner_tid.store(unsafe { GetCurrentThreadId() }, Ordering::SeqCst);
    s.faulted.store(false, Ordering::SeqCst);
    // The abandoned-frame resume must never run drop glue for a closure
    // the aborted pass already consumed.
    let mut f = std::mem::ManuallyDrop::new(f);
    unsafe { RtlCaptureContext(s.ctx.get() as *mut CONTEXT) };
    // A recovered fault inside `f` resumes execution right here with the
    // faulted flag set; re-read it from memory, never from a register.
    if s.faulted.swap(false, Ordering::SeqCst) {
        s.armed.store(false, Ordering::SeqCst);
        return None;
    }
    s.armed.store(true, Ordering::SeqCst);
    let protected = unsafe { std::mem::ManuallyDrop::take(&mut f) };
    let out = protected();
    s.armed.store(false, Ordering::SeqCst);
    Some(out)
}

/// Install the handler at the head of the vectored chain. Idempotent;
/// never removed.
pub fn install_handler() {
    static INSTALLED: std::sync::Once = std::sync::Once::new();
    INSTALLED.call_once(|| unsafe {
        AddVectoredExceptionHandler(1, Some(veh));
    });
}

unsafe extern "system" fn veh(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let record = (*info).ExceptionRecord;
    let context = (*info).ContextRecord;
    if record.is_null() || context.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let code = (*record).ExceptionCode as u32;

    // Debugger and allocator traffic is never ours.
    if matches!(
        code,
        CODE_BREAKPOINT | CODE_SINGLE_STEP | CODE_GUARD_PAGE | CODE_HEAP_CORRUPTION
    ) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let tid = GetCurrentThreadId();
    for (region, s) in [(Region::Scanner, &SCANNER), (Region::Targeting, &TARGETING)] {
        if !s.armed.load(Ordering::SeqCst) || s.owner_tid.load(Ordering::SeqCst) != tid {
            continue;
        }
        let recoverable = code == CODE_ACCESS_VIOLATION
            || (region == Region::Targeting && code == CODE_MSVC_CPP);
        if !recoverable {
            continue;
        }
        s.armed.store(false, Ordering::SeqCst);
        s.faulted.store(true, Ordering::SeqCst);
        stability::record_fault(region);
        // Rewind the thread to the save point. Allocation-free path.
        *context = *(s.ctx.get() as *const CONTEXT);
        return EXCEPTION_CONTINUE_EXECUTION;
    }

    // Not ours to recover. For a fault that is likely taking the process
    // down, leave a register dump for the post-mortem. Language-runtime
    // throws (0xE… — the game raises and catches these routinely) are
    // first-chance noise, not crashes.
    if code == CODE_ACCESS_VIOLATION || (0xC000_0000..0xE000_0000).contains(&code) {
        dump_crash(code, &*context);
    }
    EXCEPTION_CONTINUE_SEARCH
}

fn dump_crash(code: u32, ctx: &CONTEXT) {
    let base = process::module_base();
    let rva = if base != 0 && (ctx.Eip as usize) >= base {
        ctx.Eip as usize - base
    } else {
        0
    };
    logger::crash_line(&format!(
        "code=0x{:08X} eip=0x{:08X} rva=0x{:08X} \
         eax=0x{:08X} ebx=0x{:08X} ecx=0x{:08X} edx=0x{:08X} \
         esi=0x{:08X} edi=0x{:08X} ebp=0x{:08X} esp=0x{:08X} \
         cycles={} scan_faults={} attack_faults={}",
        code, ctx.Eip, rva,
        ctx.Eax, ctx.Ebx, ctx.Ecx, ctx.Edx,
        ctx.Esi, ctx.Edi, ctx.Ebp, ctx.Esp,
        snapshot::cycle_count(),
        stability::SCAN_FAULT_TOTAL.load(Ordering::Relaxed),
        stability::ATTACK_FAULT_TOTAL.load(Ordering::Relaxed),
    ));
}
