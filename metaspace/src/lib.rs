mod arena;
mod block_manager;
mod commit_mask;
mod committed_limiter;
mod config;
mod context_holder;
mod error;
mod growth_policy;
mod internal_stats;
mod metaspace;
mod metaspace_arena;
mod metaspace_gc;
mod region;
mod segment;
mod segment_manager;
mod volume;
mod volume_list;
mod util;

#[cfg(test)]
mod test;

pub mod constants;
pub mod modules;

pub use crate::arena::{Arena, ArenaUsage};
pub use crate::block_manager::BlockManager;
pub use crate::commit_mask::CommittedMask;
pub use crate::committed_limiter::{CommitPolicy, CommittedLimiter};
pub use crate::context_holder::{Context, ContextGuard, ContextHolder, ContextReport, LevelReport};
pub use crate::growth_policy::ArenaGrowthPolicy;
pub use crate::internal_stats::{InternalStats, InternalStatsSnapshot};
pub use crate::metaspace::Metaspace;
pub use crate::metaspace_arena::{MetaspaceArena, MetaspaceType};
pub use crate::metaspace_gc::{MetaspaceGc, ThresholdAdjustment, ThresholdRaise};
pub use crate::region::Region;
pub use crate::segment::{Segment, SegmentId, SegmentPool, SegmentState};
pub use crate::segment_manager::SegmentManager;
pub use crate::util::growable_array::{ArrayBacking, MetaArray};
pub use crate::volume::{Volume, VolumeId};
pub use crate::volume_list::VolumeList;
pub use config::MetaspaceConfig;
pub use error::{MetaspaceError, OutOfMemoryReport};
