/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{ptr::NonNull, sync::Arc, thread, time::Instant};

use env_logger::{Builder, Env};
use log::info;
use metaspace::{
    constants::K,
    modules::os_memory::MmapOsMemory,
    Metaspace, MetaspaceArena, MetaspaceConfig, MetaspaceType,
};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use rand_xoshiro::{
    rand_core::{RngCore as _, SeedableRng as _},
    Xoshiro128StarStar,
};

const THREADS: u64 = 8;
const ARENAS_PER_THREAD: usize = 4;
const ROUNDS: usize = 5;
const OPS_PER_ROUND: usize = 20_000;
const CONTROL_SEED: u64 = 0x5eed_cafe;

struct Allocation {
    arena: usize,
    p: NonNull<u8>,
    bytes: usize,
}

fn random_size(rng: &mut Xoshiro128StarStar) -> usize {
    match rng.next_u32() % 100 {
        0 => (rng.next_u32() as usize % (256 * K)) + 1,
        1..=9 => (rng.next_u32() as usize % (4 * K)) + 1,
        _ => (rng.next_u32() as usize % 256) + 1,
    }
}

fn run_worker(metaspace: &Metaspace, id: u64) -> usize {
    let mut control_rng = SmallRng::seed_from_u64(CONTROL_SEED + id);
    let mut seed = [0u8; 16];
    control_rng.fill_bytes(&mut seed);
    let mut size_rng = Xoshiro128StarStar::from_seed(seed);

    let mut failed = 0;
    for _ in 0..ROUNDS {
        let arenas: Vec<MetaspaceArena> = (0..ARENAS_PER_THREAD)
            .map(|i| {
                let ty = if i == 0 { MetaspaceType::Boot } else { MetaspaceType::Standard };
                MetaspaceArena::new(metaspace, ty)
            })
            .collect();
        let mut live: Vec<Allocation> = Vec::new();

        for _ in 0..OPS_PER_ROUND {
            if live.is_empty() || control_rng.next_u32() % 4 != 0 {
                let arena = control_rng.next_u32() as usize % arenas.len();
                let bytes = random_size(&mut size_rng);
                match metaspace.allocate_with_gc(&arenas[arena], bytes) {
                    Some(p) => live.push(Allocation { arena, p, bytes }),
                    None => failed += 1,
                }
            } else {
                let a = live.swap_remove(control_rng.next_u32() as usize % live.len());
                arenas[a.arena].deallocate(a.p, a.bytes);
            }
        }

        for arena in &arenas {
            arena.verify();
        }
        // dropping the arenas hands all of their segments back
    }
    failed
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_module_path(false)
        .init();

    let config = MetaspaceConfig {
        max_metaspace_size: 256 * 1024 * K,
        ..Default::default()
    };
    let metaspace = Metaspace::global_initialize(config, Arc::new(MmapOsMemory::new())).unwrap();
    metaspace.post_initialize();

    let start = Instant::now();
    let failed: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let metaspace = &metaspace;
                s.spawn(move || run_worker(metaspace, id))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    info!("{} threads done after {:?}, {} allocations failed", THREADS, start.elapsed(), failed);

    metaspace.verify();
    let committed_before = metaspace.committed_bytes();
    metaspace.purge();
    let adjustment = metaspace.compute_new_gc_threshold();
    info!(
        "purged {} -> {} committed bytes, threshold {:?} now at {}",
        committed_before,
        metaspace.committed_bytes(),
        adjustment,
        metaspace.gc().capacity_until_gc()
    );

    println!("{}", metaspace.stats_snapshot());
    println!("{}", metaspace.report());
}
