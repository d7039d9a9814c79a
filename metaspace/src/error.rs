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

use core::fmt;

/// Errors reported by the OS memory layer and by configuration checks.
///
/// Running out of budget is not an error: allocation simply yields `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaspaceError {
    ReserveFailed { bytes: usize, alignment: usize },
    CommitFailed { addr: usize, bytes: usize },
    UncommitFailed { addr: usize, bytes: usize },
    ReleaseFailed { addr: usize, bytes: usize },
    InvalidConfiguration(&'static str),
}

impl fmt::Display for MetaspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaspaceError::ReserveFailed { bytes, alignment } => write!(
                f,
                "failed to reserve {} bytes aligned to {}",
                bytes, alignment
            ),
            MetaspaceError::CommitFailed { addr, bytes } => {
                write!(f, "failed to commit {} bytes at {:#x}", bytes, addr)
            }
            MetaspaceError::UncommitFailed { addr, bytes } => {
                write!(f, "failed to uncommit {} bytes at {:#x}", bytes, addr)
            }
            MetaspaceError::ReleaseFailed { addr, bytes } => {
                write!(f, "failed to release {} bytes at {:#x}", bytes, addr)
            }
            MetaspaceError::InvalidConfiguration(reason) => {
                write!(f, "invalid metaspace configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for MetaspaceError {}

/// Report attached to the panic raised when the OS cannot honor a mapping request.
#[derive(Debug, Clone)]
pub struct OutOfMemoryReport {
    pub error: MetaspaceError,
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
}

impl fmt::Display for OutOfMemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "metaspace out of memory: {} (reserved: {} bytes, committed: {} bytes)",
            self.error, self.reserved_bytes, self.committed_bytes
        )
    }
}

/// Logs `report` and terminates the current thread of execution.
#[cold]
pub(crate) fn fatal_out_of_memory(report: OutOfMemoryReport) -> ! {
    log::error!("{}", report);
    panic!("{}", report)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        let err = MetaspaceError::CommitFailed { addr: 0x1000, bytes: 65536 };
        assert_eq!(err.to_string(), "failed to commit 65536 bytes at 0x1000");

        let report = OutOfMemoryReport {
            error: err,
            reserved_bytes: 1,
            committed_bytes: 2,
        };
        assert!(report.to_string().contains("reserved: 1 bytes"));
    }

    #[test]
    #[should_panic(expected = "metaspace out of memory")]
    fn test_fatal_panics() {
        fatal_out_of_memory(OutOfMemoryReport {
            error: MetaspaceError::ReserveFailed { bytes: 1, alignment: 1 },
            reserved_bytes: 0,
            committed_bytes: 0,
        });
    }
}
