use std::{ptr::NonNull, slice, thread};

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use rand_xoshiro::{rand_core::RngCore as _, rand_core::SeedableRng as _, Xoshiro128StarStar};

use crate::{constants::K, MetaspaceArena, MetaspaceType};

use super::{get_test_metaspace, test_config};

struct Block {
    arena: usize,
    p: NonNull<u8>,
    bytes: usize,
    fill: u8,
}

impl Block {
    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.p.as_ptr(), self.bytes) }
    }

    fn check(&self) {
        assert!(
            self.data().iter().all(|b| *b == self.fill),
            "block at {:p} overwritten",
            self.p
        );
    }
}

fn allocate_block(arenas: &[MetaspaceArena], arena: usize, bytes: usize, fill: u8) -> Block {
    let p = arenas[arena].allocate(bytes).unwrap();
    let block = Block { arena, p, bytes, fill: 0 };
    block.check();
    unsafe { p.as_ptr().write_bytes(fill, bytes) };
    Block { fill, ..block }
}

fn assert_disjoint(blocks: &[Block]) {
    let mut ranges: Vec<(usize, usize)> = blocks
        .iter()
        .map(|b| (b.p.as_ptr() as usize, b.bytes))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:x?} overlaps {:x?}", pair[0], pair[1]);
    }
}

#[test]
fn test_random_allocate_deallocate() {
    const SEED: [u8; 16] = [
        0x3a, 0x91, 0x07, 0xc4, 0x5e, 0x22, 0xf0, 0x18, 0x6b, 0xd9, 0x44, 0x8e, 0x13, 0x7f, 0xa5, 0x60,
    ];
    let mut rng = Xoshiro128StarStar::from_seed(SEED);
    let (ms, _os) = get_test_metaspace(test_config());

    let mut arenas: Vec<MetaspaceArena> = Vec::new();
    let mut blocks: Vec<Block> = Vec::new();
    for ty in [MetaspaceType::Boot, MetaspaceType::Standard, MetaspaceType::Standard] {
        arenas.push(MetaspaceArena::new(&ms, ty));
    }

    for step in 0..4000u32 {
        match rng.next_u32() % 10 {
            0..=5 => {
                let arena = rng.next_u32() as usize % arenas.len();
                let bytes = if rng.next_u32() % 50 == 0 {
                    (rng.next_u32() as usize % (64 * K)) + 1
                } else {
                    (rng.next_u32() as usize % 600) + 1
                };
                blocks.push(allocate_block(&arenas, arena, bytes, step as u8 | 1));
            }
            6..=8 if !blocks.is_empty() => {
                let block = blocks.swap_remove(rng.next_u32() as usize % blocks.len());
                block.check();
                arenas[block.arena].deallocate(block.p, block.bytes);
            }
            _ => {}
        }

        if step % 500 == 499 {
            // retire one arena with all of its blocks
            let victim = rng.next_u32() as usize % arenas.len();
            blocks.retain(|b| b.arena != victim);
            arenas.swap_remove(victim);
            let moved = arenas.len();
            for b in blocks.iter_mut().filter(|b| b.arena == moved) {
                b.arena = victim;
            }
            arenas.push(MetaspaceArena::new(&ms, MetaspaceType::Standard));
            ms.verify();
        }
    }

    blocks.iter().for_each(Block::check);
    assert_disjoint(&blocks);
    for arena in &arenas {
        arena.verify();
    }
    let used: usize = arenas.iter().map(|a| a.usage_numbers().used).sum();
    assert_eq!(ms.used_bytes(), used);
    ms.verify();

    drop(blocks);
    drop(arenas);
    assert_eq!(ms.used_bytes(), 0);
    ms.purge();
    assert_eq!(ms.committed_bytes(), 0);
}

#[test]
fn test_concurrent_arenas() {
    const SEED: u64 = 5446535461589659585;
    const THREADS: u64 = 4;
    let (ms, _os) = get_test_metaspace(test_config());

    thread::scope(|s| {
        for t in 0..THREADS {
            let ms = &ms;
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(SEED + t);
                let arenas = vec![
                    MetaspaceArena::new(ms, MetaspaceType::Standard),
                    MetaspaceArena::new(ms, MetaspaceType::Standard),
                ];
                let mut blocks = Vec::new();
                for i in 0..2000 {
                    let arena = (rng.next_u32() % 2) as usize;
                    let bytes = (rng.next_u32() as usize % 400) + 1;
                    blocks.push(allocate_block(&arenas, arena, bytes, (t as u8) << 4 | 1));
                    if i % 4 == 0 {
                        let block = blocks.swap_remove(rng.next_u32() as usize % blocks.len());
                        block.check();
                        arenas[block.arena].deallocate(block.p, block.bytes);
                    }
                }
                blocks.iter().for_each(Block::check);
                assert_disjoint(&blocks);
            });
        }
    });

    assert_eq!(ms.used_bytes(), 0);
    ms.verify();
    let stats = ms.stats_snapshot();
    assert_eq!(stats.num_arena_births, 2 * THREADS);
    assert_eq!(stats.num_arena_deaths, 2 * THREADS);
    assert_eq!(stats.num_allocs, 2000 * THREADS);
}
