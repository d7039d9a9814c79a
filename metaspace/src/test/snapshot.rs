use crate::{
    constants::K, ContextReport, InternalStatsSnapshot, MetaspaceArena, MetaspaceConfig, MetaspaceType,
};

use super::{get_test_metaspace, test_config};

#[test]
fn test_stats_serialize() {
    let (ms, _os) = get_test_metaspace(test_config());
    let arena = MetaspaceArena::new(&ms, MetaspaceType::Standard);
    let p = arena.allocate(100).unwrap();
    arena.allocate(3 * K).unwrap();
    arena.deallocate(p, 100);

    let snapshot = ms.stats_snapshot();
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["num_allocs"], 2);
    assert_eq!(json["num_deallocs"], 1);
    assert_eq!(json["num_arena_births"], 1);
    assert_eq!(json["num_volumes_births"], 1);

    let back: InternalStatsSnapshot = serde_json::from_value(json).unwrap();
    assert_eq!(back, snapshot);
    assert!(snapshot.to_string().contains("allocations"));
}

#[test]
fn test_report_serialize() {
    let (ms, _os) = get_test_metaspace(test_config());
    let arena = MetaspaceArena::new(&ms, MetaspaceType::Boot);
    arena.allocate(8).unwrap();

    let report = ms.report();
    let json = serde_json::to_string(&report).unwrap();
    let back: ContextReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);
    assert_eq!(report.num_volumes, 1);
    assert!(report.to_string().starts_with("1 volumes"));
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "max_metaspace_size": 134217728,
        "metaspace_size": 22020096,
        "min_metaspace_free_ratio": 40,
        "max_metaspace_free_ratio": 70,
        "max_metaspace_expansion": 4194304,
        "min_metaspace_expansion": 262144,
        "always_pre_touch": false,
        "max_reserved_bytes": null
    }"#;
    let config: MetaspaceConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.max_metaspace_size, 128 * 1024 * K);
    assert_eq!(config.max_reserved_bytes, None);

    let (ms, _os) = get_test_metaspace(config);
    assert_eq!(ms.config().metaspace_size, 21 * 1024 * K);
}
