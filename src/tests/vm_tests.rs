/*
 * Virtual Memory Tests
 *
 * In-kernel checks of the region, reservation and zero-fill invariants,
 * run against a scratch address space that is never loaded into cr3.
 * Every present PTE in the scratch space must either reference the
 * shared zero frame (ZFOD set, read-only) or a frame owned by exactly
 * this space.
 */

use crate::memory::types::{PteFlags, VirtAddr, PAGE_SIZE};
use crate::memory::vm::{self, AddressSpace};
use crate::memory::{frames, paging};

const TEST_REGION: u32 = 0x2000_0000;

/// Test that new_pages followed by remove_pages returns the frame
/// allocator to its previous state.
pub fn test_new_remove_round_trip() -> bool {
    log::info!("TEST: new_pages/remove_pages round trip");

    let space = AddressSpace::new().expect("scratch space");
    let before = frames::free_frames();

    if space
        .new_region(VirtAddr::new(TEST_REGION), 8 * PAGE_SIZE, true, true, true)
        .is_err()
    {
        log::error!("  FAIL: new_region refused a small region");
        return false;
    }
    let during = frames::free_frames();
    if during != before - 8 {
        log::error!(
            "  FAIL: expected 8 reserved frames, counter moved {} -> {}",
            before,
            during
        );
        return false;
    }

    if space.remove_region(VirtAddr::new(TEST_REGION)).is_err() {
        log::error!("  FAIL: remove_region refused the region start");
        return false;
    }
    let after = frames::free_frames();
    if after != before {
        log::error!("  FAIL: counter did not return: {} -> {}", before, after);
        return false;
    }

    space.free_entire_space();
    log::info!("  PASS: allocator state restored");
    true
}

/// Test that an untouched zero-fill page references the shared zero
/// frame, read-only.
pub fn test_zfod_pte_shape() -> bool {
    log::info!("TEST: ZFOD page table entry shape");

    let space = AddressSpace::new().expect("scratch space");
    space
        .new_region(VirtAddr::new(TEST_REGION), PAGE_SIZE, true, true, true)
        .expect("one zfod page");

    let Some((phys, flags)) = paging::translate(space.root(), VirtAddr::new(TEST_REGION)) else {
        log::error!("  FAIL: zfod page not present");
        return false;
    };

    let mut ok = true;
    if phys.as_u32() != vm::zero_frame().as_u32() {
        log::error!("  FAIL: page does not reference the shared zero frame");
        ok = false;
    }
    if !flags.contains(PteFlags::ZFOD) || flags.contains(PteFlags::WRITABLE) {
        log::error!("  FAIL: flags {:?} not ZFOD/read-only", flags);
        ok = false;
    }

    space.remove_region(VirtAddr::new(TEST_REGION)).expect("cleanup");
    space.free_entire_space();
    if ok {
        log::info!("  PASS: shared zero frame, ZFOD set, RW clear");
    }
    ok
}

/// Test that remove_pages refuses an address that is not the start of a
/// new_pages region.
pub fn test_remove_refuses_midpoint() -> bool {
    log::info!("TEST: remove_pages refuses region midpoint");

    let space = AddressSpace::new().expect("scratch space");
    space
        .new_region(VirtAddr::new(TEST_REGION), 4 * PAGE_SIZE, true, true, true)
        .expect("region");

    let mid = VirtAddr::new(TEST_REGION + PAGE_SIZE);
    let refused = space.remove_region(mid).is_err();
    space.remove_region(VirtAddr::new(TEST_REGION)).expect("cleanup");
    space.free_entire_space();

    if refused {
        log::info!("  PASS: midpoint refused");
        true
    } else {
        log::error!("  FAIL: midpoint accepted");
        false
    }
}

/// Test that an oversized reservation is refused before any mapping
/// mutation.
pub fn test_reservation_refused_when_exhausted() -> bool {
    log::info!("TEST: oversized reservation refused");

    let available = frames::free_frames();
    if frames::reserve(available as u32 + 1) {
        log::error!("  FAIL: reserved more frames than exist");
        frames::unreserve(available as u32 + 1);
        return false;
    }
    log::info!("  PASS: reservation refused, counter untouched");
    frames::free_frames() == available
}

/// Test that overlapping new_pages requests fail whole, leaving the
/// first mapping intact.
pub fn test_overlap_rejected_whole() -> bool {
    log::info!("TEST: overlapping new_pages rejected atomically");

    let space = AddressSpace::new().expect("scratch space");
    space
        .new_region(VirtAddr::new(TEST_REGION), 2 * PAGE_SIZE, true, true, true)
        .expect("first region");
    let before = frames::free_frames();

    let overlapping = space.new_region(
        VirtAddr::new(TEST_REGION + PAGE_SIZE),
        2 * PAGE_SIZE,
        true,
        true,
        true,
    );

    let ok = overlapping.is_err() && frames::free_frames() == before;
    space.remove_region(VirtAddr::new(TEST_REGION)).expect("cleanup");
    space.free_entire_space();

    if ok {
        log::info!("  PASS: overlap refused with no side effects");
    } else {
        log::error!("  FAIL: overlap accepted or leaked a reservation");
    }
    ok
}

pub fn run() -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    for result in [
        test_new_remove_round_trip(),
        test_zfod_pte_shape(),
        test_remove_refuses_midpoint(),
        test_reservation_refused_when_exhausted(),
        test_overlap_rejected_whole(),
    ] {
        if result {
            passed += 1;
        } else {
            failed += 1;
        }
    }
    (passed, failed)
}
