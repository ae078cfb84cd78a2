use tracing::info;

use crate::region::{HeapRegion, RegionGeometry, RegionState};
use crate::utils::formatted_size;

/// Free-region accounting over the region table.
///
/// Rebuilt under the heap lock whenever region states change in bulk. The
/// control loop logs its status before and after every cycle.
pub struct FreeSet {
    geometry: RegionGeometry,
    capacity: usize,
    used: usize,
    free_regions: usize,
    max_contiguous_free: usize,
    leftmost: usize,
    rightmost: usize,
}

impl FreeSet {
    pub fn new(geometry: RegionGeometry) -> Self {
        Self {
            geometry,
            capacity: 0,
            used: 0,
            free_regions: 0,
            max_contiguous_free: 0,
            leftmost: 0,
            rightmost: 0,
        }
    }

    pub fn rebuild(&mut self, regions: &[HeapRegion]) {
        self.capacity = 0;
        self.used = 0;
        self.free_regions = 0;
        self.max_contiguous_free = 0;
        self.leftmost = regions.len();
        self.rightmost = 0;

        let mut run = 0;
        for region in regions {
            match region.state() {
                RegionState::EmptyCommitted => {
                    self.capacity += self.geometry.region_size_bytes;
                    self.free_regions += 1;
                    self.leftmost = self.leftmost.min(region.index());
                    self.rightmost = self.rightmost.max(region.index());
                    run += 1;
                    self.max_contiguous_free = self.max_contiguous_free.max(run);
                }
                RegionState::Regular | RegionState::Trash => {
                    self.capacity += self.geometry.region_size_bytes;
                    self.used += self.geometry.region_size_bytes;
                    run = 0;
                }
                RegionState::EmptyUncommitted => {
                    run = 0;
                }
            }
        }
        if self.free_regions == 0 {
            self.leftmost = 0;
        }
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_regions(&self) -> usize {
        self.free_regions
    }

    /// One status line, emitted under the heap lock.
    pub fn log_status(&self) {
        info!(
            free = %formatted_size(self.available()),
            regions = self.free_regions,
            max_contiguous = %formatted_size(
                self.max_contiguous_free * self.geometry.region_size_bytes
            ),
            span = self.rightmost.saturating_sub(self.leftmost) + 1,
            used = %formatted_size(self.used),
            "free set"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn regions_with_states(geo: RegionGeometry, regular: &[usize]) -> Vec<HeapRegion> {
        let mut regions: Vec<_> = (0..geo.region_count)
            .map(|i| HeapRegion::new(i, 0.0))
            .collect();
        for &i in regular {
            regions[i].make_regular(64);
        }
        regions
    }

    #[test]
    fn rebuild_counts_free_and_used() {
        let geo = RegionGeometry::setup(64 * 1024 * 1024, None);
        let regions = regions_with_states(geo, &[0, 1, 5]);
        let mut fs = FreeSet::new(geo);
        fs.rebuild(&regions);

        assert_eq!(fs.free_regions(), geo.region_count - 3);
        assert_eq!(fs.used(), 3 * geo.region_size_bytes);
        assert_eq!(fs.capacity(), geo.region_count * geo.region_size_bytes);
        assert_eq!(fs.available(), (geo.region_count - 3) * geo.region_size_bytes);
    }

    #[test]
    fn uncommitted_regions_leave_capacity() {
        let geo = RegionGeometry::setup(64 * 1024 * 1024, None);
        let mut regions = regions_with_states(geo, &[]);
        regions[0].make_uncommitted();
        regions[1].make_uncommitted();
        let mut fs = FreeSet::new(geo);
        fs.rebuild(&regions);
        assert_eq!(fs.capacity(), (geo.region_count - 2) * geo.region_size_bytes);
        assert_eq!(fs.free_regions(), geo.region_count - 2);
    }
}
