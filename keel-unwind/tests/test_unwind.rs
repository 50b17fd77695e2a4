use std::ptr::NonNull;

use keel_testutils::SimHeap;
use keel_unwind::raw::Cie;
use keel_unwind::{write_trailer, DwarfTable, FnMeta, FnPart, OwnerHeader, OwnerOps, PartId};

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

unsafe fn named(owner: *const OwnerHeader) -> Option<String> {
    let owner = &*(owner as *const NamedOwner);
    Some(owner.name.clone())
}

static NAMED_OPS: OwnerOps = OwnerOps {
    has_catch: no_catch,
    find_catch: no_find,
    cleanup: no_cleanup,
    name: named,
};

#[repr(C)]
struct NamedOwner {
    header: OwnerHeader,
    name: String,
}

/// A code allocation registered with the unwind table can be walked back
/// from nothing but a pc: pc -> FDE -> code bounds -> trailer -> owner.
#[test]
fn pc_to_owner_round_trip() {
    let heap = SimHeap::new();
    let len = 0x100;
    let code = heap.alloc(len) as *mut u8;

    let owner = NamedOwner {
        header: OwnerHeader::new(&NAMED_OPS),
        name: "demo.fn".into(),
    };
    let buf = unsafe { std::slice::from_raw_parts_mut(code, len) };
    write_trailer(
        buf,
        &[FnPart { offset: 0x08, part: 0 }],
        &owner.header,
        std::ptr::null(),
    );

    let table = DwarfTable::new();
    let fde = table.alloc(code, len, plain_cie);

    let pc = unsafe { code.add(0x42) } as *const u8;
    let found = table.find(pc).expect("pc is inside the function");
    assert_eq!(found, fde);

    let fde = unsafe { found.as_ref() };
    let meta = unsafe { FnMeta::from_code(fde.code_start(), fde.code_size()) }.unwrap();
    let name = unsafe { OwnerHeader::name(meta.owner()) };
    assert_eq!(name.as_deref(), Some("demo.fn"));

    assert_eq!(meta.find_part(code, pc), PartId(0));
}

/// The FDE keeps reporting the right function after a relocation.
#[test]
fn relocation_follows_the_function() {
    let heap = SimHeap::new();
    let len = 0x80;
    let old = heap.alloc(len);
    let new = heap.alloc(len);

    let table = DwarfTable::new();
    let fde = table.alloc(old, len, plain_cie);
    assert!(table.find(unsafe { old.add(4) }).is_some());

    table.relocate(fde, new);
    assert_eq!(table.find(unsafe { old.add(4) }), None);
    assert_eq!(table.find(unsafe { new.add(4) }), Some(fde));
    assert_eq!(unsafe { fde.as_ref() }.code_start(), new);
}

/// Parallel alloc/find/free traffic on one table: lookups must only ever
/// return a record whose function covers the queried pc.
#[test]
fn concurrent_table_traffic() {
    use std::sync::Arc;

    const THREADS: usize = 8;
    const OPS: usize = 2_000;
    const BLOCK: usize = 0x40;

    let table = Arc::new(DwarfTable::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                // Each thread owns a disjoint address range, so its
                // records never alias another thread's.
                let base = 0x4000_0000 + id * 0x10_0000;
                let mut live = Vec::new();
                for at in 0..OPS {
                    match at % 4 {
                        0 => {
                            let code = (base + (at % 256) * BLOCK) as *const u8;
                            live.push(table.alloc(code, BLOCK, plain_cie));
                        }
                        1 | 2 => {
                            let probe = base + (at % 256) * BLOCK + at % BLOCK;
                            if let Some(found) = table.find(probe as *const u8) {
                                let fde = unsafe { found.as_ref() };
                                let start = fde.code_start() as usize;
                                assert!(
                                    (start..start + fde.code_size()).contains(&probe),
                                    "found a record not covering the probe"
                                );
                            }
                        }
                        _ => {
                            if let Some(fde) = live.pop() {
                                table.free(fde);
                            }
                        }
                    }
                }
                live.len()
            })
        })
        .collect();

    let live: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(table.live(), live);
}

/// Distinct (non-null) record pointers for distinct live allocations.
#[test]
fn records_are_distinct() {
    let table = DwarfTable::new();
    let heap = SimHeap::new();

    let mut fdes: Vec<NonNull<_>> = Vec::new();
    for _ in 0..16 {
        let code = heap.alloc(0x40);
        fdes.push(table.alloc(code, 0x40, plain_cie));
    }
    fdes.sort();
    fdes.dedup();
    assert_eq!(fdes.len(), 16);
    assert_eq!(table.live(), 16);
}
