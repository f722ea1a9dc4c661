// SPDX-License-Identifier: MPL-2.0

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::smmu::Smmu;

/// The attached units, looked up by their firmware cross-reference.
///
/// The platform layer owns the registry; devices find the unit that
/// translates for them through the `xref` named by their IORT node or
/// `iommus` property.
#[derive(Default)]
pub struct SmmuRegistry {
    units: Mutex<Vec<Arc<Smmu>>>,
}

impl SmmuRegistry {
    pub const fn new() -> Self {
        Self {
            units: Mutex::new(Vec::new()),
        }
    }

    /// Adds an attached unit. A unit with the same `xref` is replaced and
    /// returned.
    pub fn register(&self, smmu: Arc<Smmu>) -> Option<Arc<Smmu>> {
        let mut units = self.units.lock();
        let old = units
            .iter()
            .position(|unit| unit.xref() == smmu.xref())
            .map(|pos| units.swap_remove(pos));
        units.push(smmu);
        old
    }

    pub fn unregister(&self, xref: u64) -> Option<Arc<Smmu>> {
        let mut units = self.units.lock();
        let pos = units.iter().position(|unit| unit.xref() == xref)?;
        Some(units.swap_remove(pos))
    }

    pub fn find(&self, xref: u64) -> Option<Arc<Smmu>> {
        self.units
            .lock()
            .iter()
            .find(|unit| unit.xref() == xref)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }
}
