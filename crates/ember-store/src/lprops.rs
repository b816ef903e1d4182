//! Space accounting: per-LEB free/dirty byte counts ("LEB properties").
//!
//! The index core is a client of this table, not its owner — the real
//! allocator and garbage collector live elsewhere. The TNC's delete and
//! replace paths report newly dirtied bytes here, and replay feeds in the
//! free/dirty numbers it computes from bud scans.

use ember_error::{EmberError, Result};
use ember_types::{Geometry, LebNumber};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// LEB is reserved and must not be picked for allocation or GC.
pub const LPROPS_TAKEN: u32 = 0x01;
/// LEB holds index nodes.
pub const LPROPS_INDEX: u32 = 0x02;

/// Free/dirty accounting for one LEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LebProps {
    pub free: u32,
    pub dirty: u32,
    pub flags: u32,
}

/// In-memory LEB properties table for the main area.
pub struct LpropsTable {
    geometry: Geometry,
    props: Mutex<HashMap<LebNumber, LebProps>>,
}

impl LpropsTable {
    /// Fresh table: every main-area LEB fully free.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            props: Mutex::new(HashMap::new()),
        }
    }

    fn check_main(&self, leb: LebNumber) -> Result<()> {
        if !self.geometry.is_main_leb(leb) {
            return Err(EmberError::Format(format!(
                "LEB {leb} is not in the main area"
            )));
        }
        Ok(())
    }

    fn default_props(&self) -> LebProps {
        LebProps {
            free: self.geometry.leb_size(),
            dirty: 0,
            flags: 0,
        }
    }

    /// Current properties of `leb`, marking its record as needing
    /// writeback by the (external) LEB properties tree.
    pub fn lookup_dirty(&self, leb: LebNumber) -> Result<LebProps> {
        self.check_main(leb)?;
        let props = self.props.lock();
        Ok(props.get(&leb).copied().unwrap_or_else(|| self.default_props()))
    }

    /// Set new free/dirty counts and flags for `leb`. `None` keeps the
    /// current value of a field.
    pub fn change(
        &self,
        leb: LebNumber,
        new_free: Option<u32>,
        new_dirty: Option<u32>,
        flags: u32,
    ) -> Result<LebProps> {
        self.check_main(leb)?;
        let leb_size = self.geometry.leb_size();
        let mut props = self.props.lock();
        let entry = props.entry(leb).or_insert_with(|| LebProps {
            free: leb_size,
            dirty: 0,
            flags: 0,
        });
        if let Some(free) = new_free {
            if free > leb_size {
                return Err(EmberError::Format(format!(
                    "free {free} exceeds LEB size {leb_size}"
                )));
            }
            entry.free = free;
        }
        if let Some(dirty) = new_dirty {
            if dirty > leb_size {
                return Err(EmberError::Format(format!(
                    "dirty {dirty} exceeds LEB size {leb_size}"
                )));
            }
            entry.dirty = dirty;
        }
        entry.flags = flags;
        trace!(leb = leb.0, free = entry.free, dirty = entry.dirty, flags, "lprops change");
        Ok(*entry)
    }

    /// Account `bytes` more dirty space in `leb`.
    ///
    /// A zero-length location (a branch that was never committed) is a
    /// no-op.
    pub fn add_dirt(&self, leb: LebNumber, bytes: u32) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.check_main(leb)?;
        let leb_size = self.geometry.leb_size();
        let mut props = self.props.lock();
        let entry = props.entry(leb).or_insert_with(|| LebProps {
            free: leb_size,
            dirty: 0,
            flags: 0,
        });
        entry.dirty = entry.dirty.saturating_add(bytes).min(leb_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LpropsTable {
        let g = Geometry::new(
            4096,
            32,
            8,
            8,
            LebNumber(1),
            4,
            LebNumber(8),
            2,
            1 << 40,
        )
        .expect("geometry");
        LpropsTable::new(g)
    }

    #[test]
    fn fresh_lebs_are_fully_free() {
        let t = table();
        let p = t.lookup_dirty(LebNumber(8)).expect("lookup");
        assert_eq!(p.free, 4096);
        assert_eq!(p.dirty, 0);
        assert_eq!(p.flags, 0);
    }

    #[test]
    fn change_and_keep_fields() {
        let t = table();
        let p = t
            .change(LebNumber(8), Some(1024), Some(512), LPROPS_TAKEN)
            .expect("change");
        assert_eq!(p.free, 1024);
        assert_eq!(p.dirty, 512);
        assert_eq!(p.flags, LPROPS_TAKEN);

        // Keep free, bump dirty, change flags.
        let p = t
            .change(LebNumber(8), None, Some(600), LPROPS_TAKEN | LPROPS_INDEX)
            .expect("change");
        assert_eq!(p.free, 1024);
        assert_eq!(p.dirty, 600);
        assert_eq!(p.flags, LPROPS_TAKEN | LPROPS_INDEX);
    }

    #[test]
    fn add_dirt_accumulates_and_saturates() {
        let t = table();
        t.add_dirt(LebNumber(8), 100).expect("dirt");
        t.add_dirt(LebNumber(8), 200).expect("dirt");
        assert_eq!(t.lookup_dirty(LebNumber(8)).expect("lookup").dirty, 300);
        t.add_dirt(LebNumber(8), u32::MAX).expect("dirt");
        assert_eq!(t.lookup_dirty(LebNumber(8)).expect("lookup").dirty, 4096);
        // Zero-length dirt from never-committed branches is a no-op.
        t.add_dirt(LebNumber(3), 0).expect("dirt");
    }

    #[test]
    fn non_main_lebs_rejected() {
        let t = table();
        assert!(t.lookup_dirty(LebNumber(1)).is_err());
        assert!(t.change(LebNumber(40), Some(0), None, 0).is_err());
        assert!(t.add_dirt(LebNumber(1), 10).is_err());
    }

    #[test]
    fn bounds_checked() {
        let t = table();
        assert!(t.change(LebNumber(8), Some(5000), None, 0).is_err());
        assert!(t.change(LebNumber(8), None, Some(5000), 0).is_err());
    }
}
