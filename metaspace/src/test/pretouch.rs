use std::{ptr::NonNull, slice};

use crate::{
    constants::{COMMIT_GRANULE_BYTES, K},
    Metaspace, MetaspaceArena, MetaspaceConfig, MetaspaceType,
};

use super::{get_test_metaspace, test_config};

unsafe fn all_bytes_are(p: NonNull<u8>, bytes: usize, value: u8) -> bool {
    slice::from_raw_parts(p.as_ptr(), bytes).iter().all(|b| *b == value)
}

/// Allocates into two arenas and checks that pre-touching neither loses data
/// nor hands out dirty memory.
fn check_pretouched_allocations(ms: &Metaspace) {
    let a = MetaspaceArena::new(ms, MetaspaceType::Standard);
    let p = a.allocate(100).unwrap();
    assert_eq!(ms.committed_bytes(), COMMIT_GRANULE_BYTES);
    unsafe {
        assert!(all_bytes_are(p, 100, 0));
        p.as_ptr().write_bytes(0x5A, 100);
    }

    let b = MetaspaceArena::new(ms, MetaspaceType::Standard);
    let q = b.allocate(200 * K).unwrap();
    let committed = ms.committed_bytes();
    assert!(committed > COMMIT_GRANULE_BYTES);
    assert!(committed <= COMMIT_GRANULE_BYTES + 256 * K);
    assert_eq!(committed % COMMIT_GRANULE_BYTES, 0);
    unsafe {
        assert!(all_bytes_are(q, 200 * K, 0));
        assert!(all_bytes_are(p, 100, 0x5A));
    }

    a.verify();
    b.verify();
    ms.verify();
}

#[test]
fn test_pretouch_heap_backend() {
    let (ms, os) = get_test_metaspace(MetaspaceConfig::default());
    assert!(ms.config().always_pre_touch);

    check_pretouched_allocations(&ms);
    // every granule is touched once, when it is first committed
    assert_eq!(os.pretouched_bytes(), ms.committed_bytes());

    ms.purge();
    assert_eq!(ms.committed_bytes(), 0);
}

#[test]
fn test_no_pretouch_when_disabled() {
    let (ms, os) = get_test_metaspace(test_config());
    let a = MetaspaceArena::new(&ms, MetaspaceType::Standard);
    a.allocate(100).unwrap();
    assert_eq!(ms.committed_bytes(), COMMIT_GRANULE_BYTES);
    assert_eq!(os.pretouched_bytes(), 0);
}

#[cfg(feature = "use_libc")]
#[test]
fn test_pretouch_mmap_backend() {
    use std::sync::Arc;

    use super::init_logger;
    use crate::modules::os_memory::MmapOsMemory;

    init_logger();
    let ms = Metaspace::global_initialize(MetaspaceConfig::default(), Arc::new(MmapOsMemory::new()))
        .unwrap();
    assert!(ms.config().always_pre_touch);

    check_pretouched_allocations(&ms);

    ms.purge();
    assert_eq!(ms.committed_bytes(), 0);
    ms.verify();
}
