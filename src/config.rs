//! Run configuration and work partitioning.
//!
//! The reference program fixes the matrix size and the local work-group
//! extent at compile time.  Here they are plain values with defaults so
//! that the binary can expose them as flags, and the partition they
//! describe is validated before anything is allocated on a device.

use std::fmt;

use clap::ValueEnum;
use log::warn;

use crate::error::OffloadError;

/// Default matrix dimension used for m, n and k.
pub const DEFAULT_MATRIX_SIZE: usize = 1024;

/// Default local work-group extent along both grid axes.
///
/// 16×16 = 256 invocations is the largest square group every wgpu adapter
/// accepts under the downlevel limits.
pub const DEFAULT_GROUP_SIZE: usize = 16;

/// The category of compute target a run executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum DeviceKind {
    /// A CPU-class adapter (software rasteriser or host executor).
    Cpu,
    /// A GPU-class adapter (discrete, integrated or virtual).
    Gpu,
}

impl DeviceKind {
    /// Resolve the interactive single-line device choice.
    ///
    /// `"1"` selects the CPU.  Anything else, including an empty line or
    /// garbage, selects the GPU.  Inputs other than `"1"` and `"2"` are
    /// accepted but logged.
    pub fn from_choice(input: &str) -> Self {
        match input.trim() {
            "1" => DeviceKind::Cpu,
            "2" => DeviceKind::Gpu,
            other => {
                warn!("unrecognised device choice {other:?}, falling back to GPU");
                DeviceKind::Gpu
            }
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("CPU"),
            DeviceKind::Gpu => f.write_str("GPU"),
        }
    }
}

/// Which execution engine carries out the offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BackendKind {
    /// Real adapters enumerated through wgpu.
    #[default]
    Wgpu,
    /// The kernel formula evaluated on the host, group by group.
    Host,
}

/// Problem size and partitioning for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadConfig {
    /// Matrix dimension N; all matrices are N×N.
    pub size: usize,
    /// Local work-group extent W along both axes.
    pub group_size: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_MATRIX_SIZE,
            group_size: DEFAULT_GROUP_SIZE,
        }
    }
}

impl OffloadConfig {
    pub fn new(size: usize, group_size: usize) -> Self {
        Self { size, group_size }
    }

    /// Validate the configuration and derive the partition of the N×N
    /// output.
    pub fn partition(&self) -> Result<Partition, OffloadError> {
        Partition::new(self.size, self.size, self.group_size)
    }
}

/// A 2-D index space of one work-item per output cell, divided into
/// square local groups.
///
/// Constructing a partition guarantees that both global extents are
/// non-zero multiples of the group extent, so no work-item is ever
/// generated outside the output matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    rows: u32,
    cols: u32,
    group: u32,
}

impl Partition {
    /// Partition an output of `rows` × `cols` cells into `group` × `group`
    /// local groups.
    pub fn new(rows: usize, cols: usize, group: usize) -> Result<Self, OffloadError> {
        if group == 0 {
            return Err(OffloadError::InvalidPartition {
                reason: "group size must be at least 1".into(),
            });
        }
        if rows == 0 || cols == 0 {
            return Err(OffloadError::InvalidPartition {
                reason: format!("global extent ({rows}, {cols}) is empty"),
            });
        }
        if rows % group != 0 || cols % group != 0 {
            return Err(OffloadError::InvalidPartition {
                reason: format!(
                    "global extent ({rows}, {cols}) is not divisible by group extent ({group}, {group})"
                ),
            });
        }
        let to_u32 = |value: usize| {
            u32::try_from(value).map_err(|_| OffloadError::InvalidPartition {
                reason: format!("extent {value} does not fit in a 32-bit index"),
            })
        };
        Ok(Self {
            rows: to_u32(rows)?,
            cols: to_u32(cols)?,
            group: to_u32(group)?,
        })
    }

    /// Global extent `(rows, cols)`: one work-item per output cell.
    pub fn global(&self) -> (u32, u32) {
        (self.rows, self.cols)
    }

    /// Local group extent along each axis.
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Number of groups along each axis.
    pub fn groups(&self) -> (u32, u32) {
        (self.rows / self.group, self.cols / self.group)
    }

    /// Work-items in one local group.
    pub fn items_per_group(&self) -> u64 {
        u64::from(self.group) * u64::from(self.group)
    }

    /// Total work-items across the grid.
    pub fn work_items(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_one_selects_cpu() {
        assert_eq!(DeviceKind::from_choice("1"), DeviceKind::Cpu);
        assert_eq!(DeviceKind::from_choice(" 1\n"), DeviceKind::Cpu);
    }

    #[test]
    fn any_other_choice_selects_gpu() {
        for input in ["2", "", "x", "11", "cpu", "\n"] {
            assert_eq!(DeviceKind::from_choice(input), DeviceKind::Gpu, "input {input:?}");
        }
    }

    #[test]
    fn default_config_partitions() {
        let partition = OffloadConfig::default().partition().unwrap();
        assert_eq!(partition.global(), (1024, 1024));
        assert_eq!(partition.groups(), (64, 64));
        assert_eq!(partition.items_per_group(), 256);
    }

    #[test]
    fn indivisible_size_is_rejected() {
        let err = OffloadConfig::new(10, 4).partition().unwrap_err();
        assert!(matches!(err, OffloadError::InvalidPartition { .. }));
    }

    #[test]
    fn zero_group_and_empty_extent_are_rejected() {
        assert!(Partition::new(8, 8, 0).is_err());
        assert!(Partition::new(0, 8, 2).is_err());
    }

    #[test]
    fn rectangular_partition() {
        let partition = Partition::new(8, 12, 4).unwrap();
        assert_eq!(partition.groups(), (2, 3));
        assert_eq!(partition.work_items(), 96);
        assert!(Partition::new(8, 10, 4).is_err());
    }
}
