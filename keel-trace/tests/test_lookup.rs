use keel_testutils::SimHeap;
use keel_trace::{
    capture, format_trace, CapturedFrame, Composite, FrameFormatter, RuntimeLookup, StackTrace,
    SymbolLookup, MAX_PARAMS,
};
use keel_unwind::raw::Cie;
use keel_unwind::{write_trailer, DwarfTable, OwnerHeader, OwnerOps, PartId};

fn plain_cie(cie: &mut Cie) {
    cie.version = 1;
}

unsafe fn no_catch(_owner: *const OwnerHeader) -> bool {
    false
}

unsafe fn no_find(
    _owner: *const OwnerHeader,
    _part: PartId,
    _object: *mut u8,
) -> Option<keel_unwind::Resume> {
    None
}

unsafe fn no_cleanup(
    _owner: *const OwnerHeader,
    _frame: &keel_unwind::StackFrame,
    _until: Option<PartId>,
) {
}

unsafe fn owner_name(owner: *const OwnerHeader) -> Option<String> {
    let owner = &*(owner as *const NamedOwner);
    owner.name.clone()
}

static OPS: OwnerOps = OwnerOps {
    has_catch: no_catch,
    find_catch: no_find,
    cleanup: no_cleanup,
    name: owner_name,
};

#[repr(C)]
struct NamedOwner {
    header: OwnerHeader,
    name: Option<String>,
}

fn frame(code: *const u8) -> CapturedFrame {
    CapturedFrame {
        code,
        params: [0; MAX_PARAMS],
    }
}

#[test]
fn runtime_lookup_resolves_jit_frames() {
    let heap = SimHeap::new();
    let len = 0x100;
    let code = heap.alloc(len) as *mut u8;

    let owner = NamedOwner {
        header: OwnerHeader::new(&OPS),
        name: Some("demo.greet(core.Str)".into()),
    };
    let buf = unsafe { std::slice::from_raw_parts_mut(code, len) };
    write_trailer(buf, &[], &owner.header, std::ptr::null());

    let table = DwarfTable::new();
    table.alloc(code, len, plain_cie);

    let lookup = RuntimeLookup::with_table(&table);
    let inside = unsafe { code.add(0x20) } as *const u8;
    assert_eq!(
        lookup.format(&frame(inside)).as_deref(),
        Some("demo.greet(core.Str)")
    );

    // Addresses outside any JIT function are declined.
    assert_eq!(lookup.format(&frame(0x10 as *const u8)), None);
}

#[test]
fn unnamed_functions_get_a_placeholder() {
    let heap = SimHeap::new();
    let len = 0x80;
    let code = heap.alloc(len) as *mut u8;

    let owner = NamedOwner {
        header: OwnerHeader::new(&OPS),
        name: None,
    };
    let buf = unsafe { std::slice::from_raw_parts_mut(code, len) };
    write_trailer(buf, &[], &owner.header, std::ptr::null());

    let table = DwarfTable::new();
    table.alloc(code, len, plain_cie);

    let lookup = RuntimeLookup::with_table(&table);
    let inside = unsafe { code.add(0x8) } as *const u8;
    assert_eq!(
        lookup.format(&frame(inside)).as_deref(),
        Some("<unnamed function>")
    );
}

#[test]
fn composite_combines_native_and_jit_lookups() {
    let heap = SimHeap::new();
    let len = 0x80;
    let code = heap.alloc(len) as *mut u8;

    let owner = NamedOwner {
        header: OwnerHeader::new(&OPS),
        name: Some("jit.entry".into()),
    };
    let buf = unsafe { std::slice::from_raw_parts_mut(code, len) };
    write_trailer(buf, &[], &owner.header, std::ptr::null());

    let table = DwarfTable::new();
    table.alloc(code, len, plain_cie);

    let native = SymbolLookup::new();
    let runtime = RuntimeLookup::with_table(&table);
    let mut lookup = Composite::new();
    lookup.push(&native);
    lookup.push(&runtime);

    let mut trace = StackTrace::new();
    trace.push(frame(unsafe { code.add(4) } as *const u8));
    trace.push(frame(0x40 as *const u8));

    let formatted = format_trace(&trace, &lookup);
    let lines: Vec<&str> = formatted.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "  0: jit.entry");
    // Nothing resolves a synthetic low address; the raw pointer shows.
    assert_eq!(lines[1], "  1: 0x40");
}

#[test]
fn captured_traces_format_without_panicking() {
    let trace = capture(0);
    let lookup = SymbolLookup::new();
    let _ = format_trace(&trace, &lookup);
}
