//! Workload scenarios: a process allocates buffers and writes every element once.
//!
//! Each first touch of a page must produce exactly one PRE/POST pair; later
//! accesses to the same page must produce nothing.

mod common;

use std::collections::BTreeSet;

use common::{AddressSpace, PAGE, harness_with, pairs};
use faultprobe::{CallingConvention, TaskInfo};

/// Write every `int` of `[start, start + len)` once, in order.
fn write_every_element(space: &AddressSpace, h: &common::Harness, start: u64, len: u64) {
    let elem = std::mem::size_of::<i32>() as u64;
    for i in 0..len / elem {
        space.touch(h, start + i * elem);
    }
}

#[test]
fn sixteen_kib_buffer_faults_four_pages() {
    let h = harness_with(CallingConvention::SysV64, 64);
    let buf = 0x5600_0000_0000;
    let size = 4 * PAGE;
    let space = AddressSpace::anonymous(TaskInfo::new(1234, "test"), buf, size);
    let handle = h.registry.attach_default().unwrap();

    write_every_element(&space, &h, buf, size);

    let events = h.sink.snapshot();
    let pairs = pairs(&events);
    assert_eq!(pairs.len(), 4);

    for (i, (pre, post)) in pairs.iter().enumerate() {
        assert_eq!(pre.virtual_address, buf + i as u64 * PAGE);
        assert_eq!(post.virtual_address, pre.virtual_address);
        assert!(!pre.backing_file_present);
        assert!(!post.backing_file_present);
        assert_eq!(post.frame_present(), Some(true));

        let pfn = space.frame_of(pre.virtual_address).unwrap();
        assert_eq!(post.physical_address(), Some(pfn * PAGE));
    }

    let phys: BTreeSet<u64> =
        pairs.iter().filter_map(|(_, post)| post.physical_address()).collect();
    assert_eq!(phys.len(), 4);

    let stats = h.registry.stats();
    assert_eq!(stats.pre, 4);
    assert_eq!(stats.post, 4);
    assert_eq!(stats.frames_allocated, 4);

    h.registry.detach(&handle).unwrap();
}

#[test]
fn two_buffers_fault_independently() {
    let h = harness_with(CallingConvention::SysV64, 64);
    let task = TaskInfo::new(1235, "test");
    let small = AddressSpace::anonymous(task, 0x5600_0000_0000, 4 * PAGE);
    let large = AddressSpace::anonymous(task, 0x5600_0001_0000, 8 * PAGE);
    let handle = h.registry.attach_default().unwrap();

    write_every_element(&small, &h, small.start(), 4 * PAGE);
    write_every_element(&large, &h, large.start(), 8 * PAGE);

    let events = h.sink.snapshot();
    let pairs = pairs(&events);
    assert_eq!(pairs.len(), 12);
    assert!(pairs[..4].iter().all(|(pre, _)| pre.region_start == small.start()));
    assert!(pairs[4..].iter().all(|(pre, _)| pre.region_start == large.start()));

    let phys: BTreeSet<u64> =
        pairs.iter().filter_map(|(_, post)| post.physical_address()).collect();
    assert_eq!(phys.len(), 12);

    h.registry.detach(&handle).unwrap();
}

#[test]
fn reading_back_mapped_pages_does_not_fault() {
    let h = harness_with(CallingConvention::SysV64, 64);
    let buf = 0x5600_0000_0000;
    let space = AddressSpace::anonymous(TaskInfo::new(1236, "test"), buf, 4 * PAGE);
    let handle = h.registry.attach_default().unwrap();

    write_every_element(&space, &h, buf, 4 * PAGE);
    let after_write = h.sink.len();
    write_every_element(&space, &h, buf, 4 * PAGE);

    assert_eq!(after_write, 8);
    assert_eq!(h.sink.len(), after_write);

    h.registry.detach(&handle).unwrap();
}
