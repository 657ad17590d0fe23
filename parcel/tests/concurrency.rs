// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parcel::{
    Error, MappingKind, MemoryPermission, Partition, PartitionConfig,
    GUEST_PAGE_SIZE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ADDRESS: u64 = 0x100000;
const CHUNK_SIZE: u64 = 0x10000;
const N_THREADS: u64 = 4;
const N_OPS: usize = 500;

const PAGES_PER_CHUNK: u64 = CHUNK_SIZE / GUEST_PAGE_SIZE;

/// Randomly map and unmap pages of a chunk of the partition, keeping track
/// of what should be mapped where.
fn churn(
    partition: &Partition,
    chunk: u64,
    seed: u64,
) -> Result<Vec<Option<u64>>, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = vec![None; PAGES_PER_CHUNK as usize];

    let chunk_address = ADDRESS + chunk * CHUNK_SIZE;

    for _ in 0..N_OPS {
        let page = rng.gen_range(0..PAGES_PER_CHUNK);
        let n_pages = rng.gen_range(1..=4).min(PAGES_PER_CHUNK - page);

        let va = chunk_address + page * GUEST_PAGE_SIZE;
        let size = n_pages * GUEST_PAGE_SIZE;

        if rng.gen_bool(0.6) {
            let pa = rng.gen_range(0..0x1000u64) * GUEST_PAGE_SIZE;
            partition.map(va, pa, size)?;

            for i in 0..n_pages {
                model[(page + i) as usize] = Some(pa + i * GUEST_PAGE_SIZE);
            }

            let ptr = partition.get_pointer(va, size);
            let byte = (chunk as u8) ^ (page as u8);
            unsafe {
                ptr.as_ptr().write(byte);
                assert_eq!(ptr.as_ptr().read(), byte);
            }
        } else {
            partition.unmap(va, size)?;

            for i in 0..n_pages {
                model[(page + i) as usize] = None;
            }
        }
    }

    Ok(model)
}

fn check_chunk(partition: &Partition, chunk: u64, model: &[Option<u64>]) {
    let host_page_size = partition.host_page_size();
    let chunk_address = ADDRESS + chunk * CHUNK_SIZE;

    for (page, pa) in model.iter().enumerate() {
        let va = chunk_address + page as u64 * GUEST_PAGE_SIZE;
        assert_eq!(partition.physical_address(va), *pa);
    }

    // A host page is backed if and only if one of its guest pages is mapped.
    let pages_per_host_page = (host_page_size / GUEST_PAGE_SIZE) as usize;
    for (i, guest_pages) in model.chunks(pages_per_host_page).enumerate() {
        let va = chunk_address + i as u64 * host_page_size;
        let mapped = guest_pages.iter().any(Option::is_some);
        assert_eq!(
            partition.has_private_allocation(va, host_page_size),
            mapped,
            "Host page {va:#x} should be backed only if mapped"
        );
    }
}

fn check_tiling(partition: &Partition) {
    let mut expected_start = partition.address();
    let mut prev = None;

    for (range, kind) in partition.mappings() {
        assert_eq!(range.start, expected_start);
        assert_ne!(prev, Some(kind));
        expected_start = range.end;
        prev = Some(kind);
    }

    assert_eq!(expected_start, partition.end());
}

fn check_backing(partition: &Partition) {
    for (range, kind) in partition.mappings() {
        if kind == MappingKind::Private {
            let size = range.end - range.start;
            assert!(partition.has_private_allocation(range.start, size));
        }
    }
}

fn concurrent_churn(host_page_size: u64) -> Result<(), Error> {
    let config = PartitionConfig::builder()
        .host_page_size(host_page_size)
        .build()?;
    let partition = Arc::new(Partition::with_config(
        ADDRESS,
        N_THREADS * CHUNK_SIZE,
        config,
    )?);

    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let partition = partition.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                check_tiling(&partition);
            }
        })
    };

    let workers: Vec<_> = (0..N_THREADS)
        .map(|chunk| {
            let partition = partition.clone();
            thread::spawn(move || churn(&partition, chunk, 0xc0ffee + chunk))
        })
        .collect();

    let mut models = Vec::new();
    for worker in workers {
        models.push(worker.join().expect("Worker should not panic")?);
    }

    done.store(true, Ordering::Relaxed);
    reader.join().expect("Reader should not panic");

    for (chunk, model) in models.iter().enumerate() {
        check_chunk(&partition, chunk as u64, model);
    }
    check_tiling(&partition);
    check_backing(&partition);

    Ok(())
}

/// Map, unmap and reprotect the same pages from several threads at once.
fn overlapping_churn(host_page_size: u64) -> Result<(), Error> {
    const WINDOW: u64 = 0x8000;

    let config = PartitionConfig::builder()
        .host_page_size(host_page_size)
        .build()?;
    let partition = Arc::new(Partition::with_config(ADDRESS, WINDOW, config)?);

    let workers: Vec<_> = (0..N_THREADS)
        .map(|seed| {
            let partition = partition.clone();
            thread::spawn(move || -> Result<(), Error> {
                let mut rng = StdRng::seed_from_u64(0xbeef + seed);
                let pages = WINDOW / GUEST_PAGE_SIZE;

                for _ in 0..N_OPS {
                    let page = rng.gen_range(0..pages);
                    let n_pages = rng.gen_range(1..=4).min(pages - page);

                    let va = ADDRESS + page * GUEST_PAGE_SIZE;
                    let size = n_pages * GUEST_PAGE_SIZE;

                    match rng.gen_range(0..3) {
                        0 => partition.map(va, page * GUEST_PAGE_SIZE, size)?,
                        1 => partition.unmap(va, size)?,
                        _ => partition.reprotect(
                            va,
                            size,
                            MemoryPermission::READ_WRITE,
                            |_, _, _| {},
                        )?,
                    }
                }

                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("Worker should not panic")?;
    }

    check_tiling(&partition);
    check_backing(&partition);

    // The protection records agree with the classification.
    for (range, kind) in partition.mappings() {
        let mapped = kind == MappingKind::Private;
        let mut va = range.start;
        while va < range.end {
            assert_eq!(partition.physical_address(va).is_some(), mapped);
            assert_eq!(partition.guest_permission(va).is_some(), mapped);
            va += GUEST_PAGE_SIZE;
        }
    }

    // Host pages with no mapped guest page stay inaccessible.
    let mut page = partition.address();
    while page < partition.end() {
        if !partition.has_private_allocation(page, host_page_size) {
            assert_eq!(
                partition.host_permission(page),
                Some(MemoryPermission::NONE),
                "Host page {page:#x} should be inaccessible"
            );
        }
        page += host_page_size;
    }

    Ok(())
}

#[test]
fn concurrent_map_unmap() -> Result<(), Error> {
    concurrent_churn(0x1000)
}

#[test]
fn concurrent_map_unmap_with_large_host_pages() -> Result<(), Error> {
    concurrent_churn(0x4000)
}

#[test]
fn overlapping_map_unmap() -> Result<(), Error> {
    overlapping_churn(0x1000)
}

#[test]
fn overlapping_map_unmap_with_large_host_pages() -> Result<(), Error> {
    overlapping_churn(0x4000)
}
