// process.rs — Introspection of the host module we live inside.
//
// The host module is the game executable itself (the DLL is injected into
// it); all RVAs in the offset registry are relative to its load base. The
// PE section table of the live image drives the locator's data-section
// fallback scan and the code-section bounds for xref scans / code dumps.

use pelite::image::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE};
use pelite::pe32::{Pe, PeView};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use winapi::um::libloaderapi::GetModuleHandleA;
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::psapi::{GetModuleInformation, MODULEINFO};

/// Cached (base, end) of the host executable image.
static MODULE_RANGE: (AtomicUsize, AtomicUsize) = (AtomicUsize::new(0), AtomicUsize::new(0));

/// Base address the host executable is loaded at.
pub fn module_base() -> usize {
    module_range().0
}

/// (base, end) of the host executable image, queried once.
pub fn module_range() -> (usize, usize) {
    let cached = MODULE_RANGE.0.load(Ordering::Relaxed);
    if cached != 0 {
        return (cached, MODULE_RANGE.1.load(Ordering::Relaxed));
    }
    let (base, end) = unsafe { query_module_range() };
    MODULE_RANGE.1.store(end, Ordering::Relaxed);
    MODULE_RANGE.0.store(base, Ordering::Relaxed);
    (base, end)
}

unsafe fn query_module_range() -> (usize, usize) {
    let h = GetModuleHandleA(ptr::null());
    if h.is_null() {
        return (0, 0);
    }
    let mut info: MODULEINFO = mem::zeroed();
    let ok = GetModuleInformation(
        GetCurrentProcess(), h, &mut info,
        mem::size_of::<MODULEINFO>() as u32,
    );
    if ok == 0 {
        return (h as usize, h as usize);
    }
    (
        info.lpBaseOfDll as usize,
        info.lpBaseOfDll as usize + info.SizeOfImage as usize,
    )
}

/// Address → RVA relative to the host image base.
#[inline]
pub fn to_rva(addr: usize) -> u32 {
    addr.wrapping_sub(module_base()) as u32
}

/// RVA → address in the live image.
#[inline]
pub fn from_rva(rva: u32) -> usize {
    module_base().wrapping_add(rva as usize)
}

/// One section of the live host image.
pub struct Section {
    pub name: String,
    pub start: usize,
    pub size: usize,
    pub characteristics: u32,
}

impl Section {
    pub fn is_code(&self) -> bool {
        self.characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0 && !self.is_code()
    }
}

/// Parse the section table of the loaded host image.
pub fn sections() -> Vec<Section> {
    let base = module_base();
    if base == 0 {
        return Vec::new();
    }
    // The image is mapped and never unloads; PeView::module only reads
    // the headers at base.
    let view = unsafe { PeView::module(base as *const u8) };
    view.section_headers()
        .iter()
        .map(|sh| Section {
            name: sh.name().map(|n| n.to_string()).unwrap_or_default(),
            start: base + sh.VirtualAddress as usize,
            size: sh.VirtualSize as usize,
            characteristics: sh.Characteristics,
        })
        .collect()
}

/// (start, end) of the first executable section (the .text of the host).
pub fn code_section() -> Option<(usize, usize)> {
    sections()
        .iter()
        .find(|s| s.is_code())
        .map(|s| (s.start, s.start + s.size))
}

/// All writable non-code sections (.data, .bss and friends).
pub fn writable_data_sections() -> Vec<(usize, usize)> {
    sections()
        .iter()
        .filter(|s| s.is_writable_data())
        .map(|s| (s.start, s.start + s.size))
        .collect()
}
