//! Component F: Disk Descriptor.
//!
//! `DiskDescriptor.` is a file (found by name, not by a fixed leader VDA)
//! holding geometry, the last-issued serial number, and the free-page
//! bitmap.  The bitmap is MSB-first: VDA `v` is bit `v mod 16` of word
//! `v/16`, 1 = in use (spec.md §3/§4.6).

use log::{debug, warn};

use crate::img::backing::SectorStore;
use crate::img::{Error as ImgError, Family};

use super::accessor::{Accessor, Target};
use super::directory::Directory;
use super::file_view::FileView;
use super::{Error, FileSystemOptions};

/// `(stored, counted)` freePages values when `DiskDescriptor::open` had to
/// reconcile a mismatch, surfaced to the caller for `FileSystem::check`.
pub type FreeCountReconciliation = Option<(usize, usize)>;

const OFFSET_N_DISKS: isize = 0;
const OFFSET_N_TRACKS: isize = 1;
const OFFSET_N_HEADS: isize = 2;
const OFFSET_N_SECTORS: isize = 3;
const OFFSET_LAST_SERIAL_HI: isize = 4;
const OFFSET_LAST_SERIAL_LO: isize = 5;
const OFFSET_FREE_PAGES: isize = 9;
const BITMAP_OFFSET_SMALL: isize = 16;
const BITMAP_OFFSET_LARGE: isize = 1024;

pub struct DiskDescriptor {
    vdas: Vec<usize>,
    n_vdas: usize,
    bitmap_offset: isize,
}

impl DiskDescriptor {
    /// Open `DiskDescriptor.` through `directory`, reconciling the stored
    /// geometry and free count against the backing store per spec.md §4.6.
    /// Returns the `(stored, counted)` freePages pair when reconciliation
    /// had to correct a mismatch, so the caller can surface it as a finding.
    pub fn open(store: &mut dyn SectorStore, directory: &Directory) -> Result<(Self, FreeCountReconciliation), Error> {
        let entry = directory
            .lookup(store, "DiskDescriptor.")?
            .ok_or_else(|| Error::FileNotFound("DiskDescriptor.".to_string()))?;
        let view = FileView::by_leader(store, entry.fp.leader_vda)?;
        let vdas = view.vdas;

        let geom = store.geometry().clone();
        let bitmap_offset = match geom.family {
            Family::Small => BITMAP_OFFSET_SMALL,
            Family::Large => BITMAP_OFFSET_LARGE,
        };

        let mut acc = Accessor::new(store);
        let target = Target::File(&vdas);
        let stored_n_disks = acc.get_word(target, OFFSET_N_DISKS)? as usize;
        let stored_n_tracks = acc.get_word(target, OFFSET_N_TRACKS)? as usize;
        let stored_n_heads = acc.get_word(target, OFFSET_N_HEADS)? as usize;
        let stored_n_sectors = acc.get_word(target, OFFSET_N_SECTORS)? as usize;
        drop(acc);

        if stored_n_disks == 2 && geom.n_disks == 1 {
            store.attach_second_drive()?;
        }
        let geom = store.geometry().clone();

        check_field("nTracks", stored_n_tracks, geom.n_tracks)?;
        check_field("nHeads", stored_n_heads, geom.n_heads)?;
        check_field("nSectors", stored_n_sectors, geom.n_sectors)?;
        if stored_n_disks != geom.n_disks {
            return Err(Error::Image(ImgError::GeometryMismatch { field: "nDisks", expected: stored_n_disks, found: geom.n_disks }));
        }

        let n_vdas = geom.n_vdas();
        let descriptor = DiskDescriptor { vdas, n_vdas, bitmap_offset };

        let mut acc = Accessor::new(store);
        let counted = descriptor.count_free_bits(&mut acc)?;
        let stored_free = acc.get_word(Target::File(&descriptor.vdas), OFFSET_FREE_PAGES)?;
        let reconciliation = if stored_free as usize != counted {
            warn!(
                "disk descriptor freePages ({}) disagrees with bitmap count ({}); reconciling",
                stored_free, counted
            );
            acc.set_word(Target::File(&descriptor.vdas), OFFSET_FREE_PAGES, counted as u16)?;
            Some((stored_free as usize, counted))
        } else {
            None
        };
        Ok((descriptor, reconciliation))
    }

    fn bit_position(&self, vda: usize) -> (isize, u16) {
        let word = self.bitmap_offset + (vda / 16) as isize;
        let bit = 15 - (vda % 16) as u16;
        (word, bit)
    }

    pub fn is_page_free(&self, store: &mut dyn SectorStore, vda: usize) -> Result<bool, Error> {
        let mut acc = Accessor::new(store);
        let (word_idx, bit) = self.bit_position(vda);
        let word = acc.get_word(Target::File(&self.vdas), word_idx)?;
        Ok((word >> bit) & 1 == 0)
    }

    fn set_page_bit(&self, acc: &mut Accessor, vda: usize, in_use: bool) -> Result<(), ImgError> {
        let (word_idx, bit) = self.bit_position(vda);
        let word = acc.get_word(Target::File(&self.vdas), word_idx)?;
        let new_word = if in_use { word | (1 << bit) } else { word & !(1 << bit) };
        acc.set_word(Target::File(&self.vdas), word_idx, new_word)
    }

    fn count_free_bits(&self, acc: &mut Accessor) -> Result<usize, ImgError> {
        let mut free = 0usize;
        for vda in 0..self.n_vdas {
            let (word_idx, bit) = self.bit_position(vda);
            let word = acc.get_word(Target::File(&self.vdas), word_idx)?;
            if (word >> bit) & 1 == 0 {
                free += 1;
            }
        }
        Ok(free)
    }

    fn adjust_free_pages(&self, acc: &mut Accessor, delta: i64) -> Result<(), ImgError> {
        let current = acc.get_word(Target::File(&self.vdas), OFFSET_FREE_PAGES)? as i64;
        let updated = (current + delta).max(0) as u16;
        acc.set_word(Target::File(&self.vdas), OFFSET_FREE_PAGES, updated)
    }

    /// Linear first-fit scan for a free VDA; marks it in-use and decrements
    /// `freePages` before returning (spec.md §4.6).
    pub fn allocate(&self, store: &mut dyn SectorStore) -> Result<usize, Error> {
        let mut acc = Accessor::new(store);
        for vda in 0..self.n_vdas {
            let (word_idx, bit) = self.bit_position(vda);
            let word = acc.get_word(Target::File(&self.vdas), word_idx)?;
            if (word >> bit) & 1 == 0 {
                self.set_page_bit(&mut acc, vda, true)?;
                self.adjust_free_pages(&mut acc, -1)?;
                debug!("disk descriptor: allocated page {}", vda);
                return Ok(vda);
            }
        }
        Err(Error::OutOfSpace)
    }

    pub fn free(&self, store: &mut dyn SectorStore, vda: usize) -> Result<(), Error> {
        let mut acc = Accessor::new(store);
        self.set_page_bit(&mut acc, vda, false)?;
        self.adjust_free_pages(&mut acc, 1)?;
        debug!("disk descriptor: freed page {}", vda);
        Ok(())
    }

    /// Bump the last-issued serial number and return the new `(hi, lo)` pair
    /// for a freshly created file's FID.  Carry into `lastSerial_hi` only
    /// when `carry_serial_overflow` asks for it (spec.md §9 Open Question).
    pub fn next_serial(&self, store: &mut dyn SectorStore, options: &FileSystemOptions) -> Result<(u16, u16), Error> {
        let mut acc = Accessor::new(store);
        let hi = acc.get_word(Target::File(&self.vdas), OFFSET_LAST_SERIAL_HI)?;
        let lo = acc.get_word(Target::File(&self.vdas), OFFSET_LAST_SERIAL_LO)?;
        let (new_lo, overflowed) = lo.overflowing_add(1);
        let new_hi = if overflowed && options.carry_serial_overflow { hi.wrapping_add(1) } else { hi };
        acc.set_word(Target::File(&self.vdas), OFFSET_LAST_SERIAL_HI, new_hi)?;
        acc.set_word(Target::File(&self.vdas), OFFSET_LAST_SERIAL_LO, new_lo)?;
        Ok((new_hi, new_lo))
    }
}

fn check_field(field: &'static str, stored: usize, actual: usize) -> Result<(), Error> {
    if stored != actual {
        return Err(Error::Image(ImgError::GeometryMismatch { field, expected: stored, found: actual }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::Geometry;

    struct MemStore {
        geometry: Geometry,
        sectors: Vec<Vec<u8>>,
    }
    impl SectorStore for MemStore {
        fn geometry(&self) -> &Geometry {
            &self.geometry
        }
        fn get(&mut self, vda: usize, _writable: bool) -> Result<&mut [u8], ImgError> {
            self.sectors.get_mut(vda).map(|s| s.as_mut_slice()).ok_or(ImgError::BadAddress(vda))
        }
        fn attach_second_drive(&mut self) -> Result<(), ImgError> {
            Err(ImgError::SecondDriveMissing("test store has no sibling".to_string()))
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bit_position_is_msb_first() {
        let _ = env_logger::try_init();
        let geometry = Geometry::small(1, 203);
        let descriptor = DiskDescriptor { vdas: vec![0], n_vdas: geometry.n_vdas(), bitmap_offset: BITMAP_OFFSET_SMALL };
        assert_eq!(descriptor.bit_position(0), (BITMAP_OFFSET_SMALL, 15));
        assert_eq!(descriptor.bit_position(1), (BITMAP_OFFSET_SMALL, 14));
        assert_eq!(descriptor.bit_position(16), (BITMAP_OFFSET_SMALL + 1, 15));
    }

    #[test]
    fn allocate_then_free_round_trips_free_count() {
        let geometry = Geometry::small(1, 203);
        let n_vdas = geometry.n_vdas();
        let mut store = MemStore { sectors: vec![vec![0u8; geometry.sector_bytes()]; 3], geometry };
        let descriptor = DiskDescriptor { vdas: vec![0, 1, 2], n_vdas, bitmap_offset: BITMAP_OFFSET_SMALL };
        {
            let mut acc = Accessor::new(&mut store);
            acc.set_word(Target::File(&descriptor.vdas), OFFSET_FREE_PAGES, n_vdas as u16).unwrap();
        }
        let vda = descriptor.allocate(&mut store).unwrap();
        assert!(!descriptor.is_page_free(&mut store, vda).unwrap());
        descriptor.free(&mut store, vda).unwrap();
        assert!(descriptor.is_page_free(&mut store, vda).unwrap());
    }
}
