use std::sync::Arc;

use env_logger::Env;

use crate::{modules::os_memory::HeapOsMemory, Metaspace, MetaspaceConfig};

mod pretouch;
mod snapshot;
mod stress;

pub(crate) fn init_logger() {
    let _ = env_logger::Builder::from_env(Env::default())
        .format_module_path(false)
        .is_test(true)
        .try_init();
}

/// Default configuration without pre-touching, so tests only touch what they allocate.
pub(crate) fn test_config() -> MetaspaceConfig {
    MetaspaceConfig {
        always_pre_touch: false,
        ..Default::default()
    }
}

pub(crate) fn get_test_metaspace(config: MetaspaceConfig) -> (Arc<Metaspace>, Arc<HeapOsMemory>) {
    init_logger();
    let os = Arc::new(HeapOsMemory::new());
    let metaspace = Metaspace::global_initialize(config, os.clone()).unwrap();
    (metaspace, os)
}
