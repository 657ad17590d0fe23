// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use parcel::{Error, MemoryPermission, Partition, PartitionConfig};

const PA: u64 = 0x8000_0000;

fn partition(host_page_size: u64) -> Result<Partition, Error> {
    let config = PartitionConfig::builder()
        .host_page_size(host_page_size)
        .build()?;
    Partition::with_config(0x10000, 0x10000, config)
}

#[test]
fn mapped_pages_start_writable() -> Result<(), Error> {
    let partition = partition(0x1000)?;

    assert_eq!(
        partition.host_permission(0x11000),
        Some(MemoryPermission::NONE)
    );
    assert_eq!(partition.guest_permission(0x11000), None);

    partition.map(0x11000, PA, 0x1000)?;

    assert_eq!(
        partition.host_permission(0x11000),
        Some(MemoryPermission::READ_WRITE)
    );
    assert_eq!(
        partition.guest_permission(0x11000),
        Some(MemoryPermission::READ_WRITE)
    );

    Ok(())
}

#[test]
fn reprotect_reports_mapped_ranges() -> Result<(), Error> {
    let partition = partition(0x1000)?;

    partition.map(0x11000, PA, 0x1000)?;
    partition.map(0x13000, PA + 0x2000, 0x2000)?;

    let mut updates = Vec::new();
    partition.reprotect(
        0x10800,
        0x4000,
        MemoryPermission::READ,
        |va, ptr, size| updates.push((va, ptr, size)),
    )?;

    // The request is widened to guest pages, and only mapped ranges are
    // reported.
    assert_eq!(
        updates,
        vec![
            (0x11000, partition.get_pointer(0x11000, 0x1000), 0x1000),
            (0x13000, partition.get_pointer(0x13000, 0x2000), 0x2000),
        ]
    );

    assert_eq!(
        partition.guest_permission(0x11000),
        Some(MemoryPermission::READ)
    );
    assert_eq!(
        partition.guest_permission(0x14000),
        Some(MemoryPermission::READ)
    );
    assert_eq!(partition.guest_permission(0x12000), None);
    assert_eq!(
        partition.host_permission(0x13000),
        Some(MemoryPermission::READ)
    );

    // Past the end of the widened request.
    partition.map(0x15000, PA, 0x1000)?;
    assert_eq!(
        partition.host_permission(0x15000),
        Some(MemoryPermission::READ_WRITE)
    );

    Ok(())
}

#[test]
fn reprotect_unmapped_range_does_nothing() -> Result<(), Error> {
    let partition = partition(0x1000)?;

    let mut count = 0;
    partition.reprotect(0x10000, 0x10000, MemoryPermission::READ, |_, _, _| {
        count += 1
    })?;

    assert_eq!(count, 0);
    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::NONE)
    );

    Ok(())
}

#[test]
fn host_pages_get_the_union_of_their_guest_pages() -> Result<(), Error> {
    let partition = partition(0x4000)?;

    partition.map(0x10000, PA, 0x4000)?;

    partition.reprotect(0x10000, 0x1000, MemoryPermission::READ, |_, _, _| {})?;

    // The other guest pages in the host page still need to be writable.
    assert_eq!(
        partition.guest_permission(0x10000),
        Some(MemoryPermission::READ)
    );
    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ_WRITE)
    );

    partition.reprotect(
        0x11000,
        0x3000,
        MemoryPermission::READ_EXECUTE,
        |_, _, _| {},
    )?;

    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ_EXECUTE)
    );

    partition.reprotect(0x11000, 0x3000, MemoryPermission::READ, |_, _, _| {})?;

    assert_eq!(
        partition.host_permission(0x13fff),
        Some(MemoryPermission::READ)
    );

    let ptr = partition.get_pointer(0x12000, 0x1000);
    assert_eq!(unsafe { ptr.as_ptr().read() }, 0);

    Ok(())
}

#[test]
fn unmapped_guest_pages_do_not_widen_permissions() -> Result<(), Error> {
    let partition = partition(0x4000)?;

    partition.map(0x10000, PA, 0x2000)?;
    partition.reprotect(0x10000, 0x2000, MemoryPermission::READ, |_, _, _| {})?;

    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ)
    );

    partition.unmap(0x11000, 0x1000)?;
    partition.reprotect(0x10000, 0x1000, MemoryPermission::NONE, |_, _, _| {})?;

    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::NONE)
    );
    assert_eq!(
        partition.guest_permission(0x10000),
        Some(MemoryPermission::NONE)
    );

    Ok(())
}

#[test]
fn mapping_into_protected_host_page_is_writable() -> Result<(), Error> {
    let partition = partition(0x4000)?;

    partition.map(0x10000, PA, 0x1000)?;
    partition.reprotect(0x10000, 0x1000, MemoryPermission::READ, |_, _, _| {})?;
    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ)
    );

    // The host page is already backed, but the new guest page must be
    // writable.
    partition.map(0x11000, PA + 0x1000, 0x1000)?;

    assert_eq!(
        partition.guest_permission(0x11000),
        Some(MemoryPermission::READ_WRITE)
    );
    assert_eq!(
        partition.host_permission(0x11000),
        Some(MemoryPermission::READ_WRITE)
    );
    assert_eq!(
        partition.guest_permission(0x10000),
        Some(MemoryPermission::READ)
    );

    let ptr = partition.get_pointer(0x11000, 0x1000);
    unsafe {
        ptr.as_ptr().write(0x5a);
        assert_eq!(ptr.as_ptr().read(), 0x5a);
    }

    Ok(())
}

#[test]
fn unmapping_narrows_shared_host_pages() -> Result<(), Error> {
    let partition = partition(0x4000)?;

    partition.map(0x10000, PA, 0x2000)?;
    partition.reprotect(0x10000, 0x1000, MemoryPermission::READ, |_, _, _| {})?;
    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ_WRITE)
    );

    // Only the read-only guest page is left in the host page.
    partition.unmap(0x11000, 0x1000)?;

    assert_eq!(
        partition.host_permission(0x10000),
        Some(MemoryPermission::READ)
    );
    assert!(partition.has_private_allocation(0x10000, 0x4000));

    Ok(())
}
