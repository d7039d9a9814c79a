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

use log::debug;

use crate::{
    constants::{COMMIT_GRANULE_BYTES, K, M},
    error::MetaspaceError,
    util::align_down_bounded,
};

/// Tunables of the metaspace budget.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaspaceConfig {
    /// Hard cap on committed bytes.
    pub max_metaspace_size: usize,
    /// Initial GC threshold, also its lower bound.
    pub metaspace_size: usize,
    /// Minimum percentage of the threshold kept free after a collection.
    pub min_metaspace_free_ratio: usize,
    /// Maximum percentage of the threshold kept free after a collection.
    pub max_metaspace_free_ratio: usize,
    /// Upper bound of a threshold raise on behalf of one allocation.
    pub max_metaspace_expansion: usize,
    /// Smallest threshold change worth applying.
    pub min_metaspace_expansion: usize,
    /// Touch every committed page right after committing it.
    pub always_pre_touch: bool,
    /// Cap on reserved address space. `None` reserves new volumes as needed.
    pub max_reserved_bytes: Option<usize>,
}

impl Default for MetaspaceConfig {
    fn default() -> Self {
        Self {
            max_metaspace_size: usize::MAX,
            metaspace_size: 21 * M,
            min_metaspace_free_ratio: 40,
            max_metaspace_free_ratio: 70,
            max_metaspace_expansion: 4 * M,
            min_metaspace_expansion: 256 * K,
            always_pre_touch: true,
            max_reserved_bytes: None,
        }
    }
}

impl MetaspaceConfig {
    /// Clamps and aligns all values to the commit granule so that
    /// `metaspace_size <= max_metaspace_size` holds afterwards.
    pub fn ergo_initialize(&mut self) {
        self.max_metaspace_size = self.max_metaspace_size.max(COMMIT_GRANULE_BYTES);
        self.metaspace_size = self.metaspace_size.min(self.max_metaspace_size);

        self.max_metaspace_size = align_down_bounded(self.max_metaspace_size, COMMIT_GRANULE_BYTES);
        self.metaspace_size = align_down_bounded(self.metaspace_size, COMMIT_GRANULE_BYTES);

        self.min_metaspace_free_ratio = self.min_metaspace_free_ratio.min(100);
        self.max_metaspace_free_ratio = self.max_metaspace_free_ratio.min(100);

        self.max_metaspace_expansion =
            align_down_bounded(self.max_metaspace_expansion, COMMIT_GRANULE_BYTES);
        self.min_metaspace_expansion =
            align_down_bounded(self.min_metaspace_expansion, COMMIT_GRANULE_BYTES);

        debug!(
            "ergo_initialize: max {} bytes, initial threshold {} bytes, free ratio {}..{}, expansion {}..{}",
            self.max_metaspace_size,
            self.metaspace_size,
            self.min_metaspace_free_ratio,
            self.max_metaspace_free_ratio,
            self.min_metaspace_expansion,
            self.max_metaspace_expansion
        );
    }

    pub fn validate(&self) -> Result<(), MetaspaceError> {
        if self.metaspace_size > self.max_metaspace_size {
            return Err(MetaspaceError::InvalidConfiguration(
                "metaspace_size exceeds max_metaspace_size",
            ));
        }
        if self.min_metaspace_free_ratio > self.max_metaspace_free_ratio {
            return Err(MetaspaceError::InvalidConfiguration(
                "min_metaspace_free_ratio exceeds max_metaspace_free_ratio",
            ));
        }
        if self.min_metaspace_expansion > self.max_metaspace_expansion {
            return Err(MetaspaceError::InvalidConfiguration(
                "min_metaspace_expansion exceeds max_metaspace_expansion",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::is_aligned;

    #[test]
    fn test_defaults_survive_ergo() {
        let mut config = MetaspaceConfig::default();
        config.ergo_initialize();
        assert_eq!(config.metaspace_size, 21 * M);
        assert!(is_aligned(config.max_metaspace_size, COMMIT_GRANULE_BYTES));
        assert_eq!(config.min_metaspace_expansion, 256 * K);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ergo_clamps() {
        let mut config = MetaspaceConfig {
            max_metaspace_size: 1000,
            metaspace_size: 21 * M,
            min_metaspace_free_ratio: 140,
            max_metaspace_free_ratio: 250,
            max_metaspace_expansion: 100 * K,
            min_metaspace_expansion: 1,
            ..Default::default()
        };
        config.ergo_initialize();
        assert_eq!(config.max_metaspace_size, COMMIT_GRANULE_BYTES);
        assert_eq!(config.metaspace_size, COMMIT_GRANULE_BYTES);
        assert_eq!(config.min_metaspace_free_ratio, 100);
        assert_eq!(config.max_metaspace_free_ratio, 100);
        assert_eq!(config.max_metaspace_expansion, 64 * K);
        assert_eq!(config.min_metaspace_expansion, 64 * K);
    }

    #[test]
    fn test_validate_rejects_inverted_ratios() {
        let config = MetaspaceConfig {
            min_metaspace_free_ratio: 80,
            max_metaspace_free_ratio: 20,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MetaspaceError::InvalidConfiguration(_))
        ));
    }
}
