//! # File System Module
//!
//! Binds the file view, directory, and disk descriptor together into a
//! `FileSystem` over a single image: the top of the stack described in the
//! module docs of `img`.  Everything below this module is pure geometry and
//! accessor plumbing; everything here understands names, files, and the
//! create/delete lifecycle (spec.md §4.7).

pub mod accessor;
pub mod directory;
pub mod disk_descriptor;
pub mod file_view;

use log::{debug, info, warn};
use thiserror::Error;

use crate::img::backing::{self, SectorStore};
use crate::img::{Error as ImgError, Geometry};

use directory::{Directory, FilePointer};
use disk_descriptor::DiskDescriptor;
use file_view::{get_fid, set_da, set_fid, Fid, FileView, HINT_LAST_PAGE_FA_OFFSET, NAME_OFFSET, PROPERTY_OFFSET};

/// Enumerates file-system-level errors (directory, disk descriptor, and the
/// create/delete lifecycle).  Errors from the image/geometry layer surface
/// here too via `Image`, so a caller only needs to match one enum once it is
/// past `FileSystem::mount`.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Image(#[from] ImgError),
    #[error("no free page available")]
    OutOfSpace,
    #[error("no free directory entry large enough for `{0}`")]
    DirectoryFull(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
}

/// User-facing choices that do not change wire semantics, only the
/// resolution of the one genuine open question in this format (serial-number
/// carry on overflow, spec.md §9).
#[derive(Clone, Copy, Debug)]
pub struct FileSystemOptions {
    /// Carry an overflowing `lastSerial_lo` increment into `lastSerial_hi`.
    /// Default `false`, matching the source this crate is grounded on.
    pub carry_serial_overflow: bool,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        FileSystemOptions { carry_serial_overflow: false }
    }
}

/// One non-fatal finding from `FileSystem::check` (spec.md §3 invariants I1-I5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckFinding {
    /// I1: a VDA marked free in the bitmap does not have `FID = (-1,-1,-1)`.
    FreeVdaNotMarkedFree { vda: usize },
    /// I2: a VDA reachable from a file is marked free in the bitmap.
    ReachableVdaMarkedFree { vda: usize, file: String },
    /// I4: `freePages` disagreed with the counted zero bits (reconciled on open).
    FreeCountReconciled { stored: usize, counted: usize },
}

/// A mounted Alto-class image: backing store plus the three long-lived file
/// views (directory, disk descriptor) that write through on every call.
pub struct FileSystem {
    store: Box<dyn SectorStore>,
    options: FileSystemOptions,
    directory: Directory,
    descriptor: DiskDescriptor,
    free_count_reconciliation: disk_descriptor::FreeCountReconciliation,
}

impl FileSystem {
    /// Open `path`, select its family (component A/B), and open `SysDir.`
    /// and `DiskDescriptor.` (components E/F), reconciling geometry and free
    /// count per spec.md §4.6.
    pub fn mount(path: &str, options: FileSystemOptions) -> Result<Self, Error> {
        let mut store = backing::open(path)?;
        info!("mounted {} ({:?} family, {} VDAs)", path, store.geometry().family, store.geometry().n_vdas());
        let directory = Directory::open(store.as_mut())?;
        let (descriptor, free_count_reconciliation) = DiskDescriptor::open(store.as_mut(), &directory)?;
        Ok(FileSystem { store, options, directory, descriptor, free_count_reconciliation })
    }

    pub fn geometry(&self) -> &Geometry {
        self.store.geometry()
    }

    /// Resolve `name` to a `FileView`, or `None` if absent (spec.md §4.4).
    pub fn open_file(&mut self, name: &str) -> Result<Option<FileView>, Error> {
        let entry = match self.directory.lookup(self.store.as_mut(), name)? {
            Some(e) => e,
            None => return Ok(None),
        };
        Ok(Some(FileView::by_leader(self.store.as_mut(), entry.fp.leader_vda)?))
    }

    pub fn list(&mut self) -> Result<Vec<String>, Error> {
        Ok(self.directory.list(self.store.as_mut())?.into_iter().map(|e| e.name).collect())
    }

    /// Read the first `view.length` bytes as text, CR translated to LF
    /// (spec.md §4.4).
    pub fn read_text(&mut self, view: &FileView) -> Result<String, Error> {
        Ok(file_view::read_as_string(self.store.as_mut(), view)?)
    }

    /// Create `name` with `n_bytes` of zeroed content, per spec.md §4.7.
    pub fn create_file(&mut self, name: &str, n_bytes: usize) -> Result<FileView, Error> {
        let name = directory::normalize(name);
        let data_words = self.geometry().data_words;
        let page_capacity = 2 * data_words;

        // pagesNeeded = ceil((nBytes + pageCapacity) / pageCapacity), plus one more
        // page when nBytes lands on an exact multiple (the last page may never be
        // full, spec.md §9).
        let mut pages_needed = (n_bytes + page_capacity).div_ceil(page_capacity);
        if n_bytes % page_capacity == 0 {
            pages_needed += 1;
        }

        let mut vdas = Vec::with_capacity(pages_needed);
        for _ in 0..pages_needed {
            let vda = self.allocate_checked()?;
            vdas.push(vda);
        }

        let (serial_hi, serial_lo) = self.descriptor.next_serial(self.store.as_mut(), &self.options)?;
        let fid = Fid { version: 1, serial_hi, serial_lo };
        // Leader (index 0) is always a full, non-terminal page; only the data
        // pages after it draw down the caller's byte budget.
        let mut remaining = n_bytes;

        for (i, &vda) in vdas.iter().enumerate() {
            let geom = self.store.geometry().clone();
            let is_last = i + 1 == vdas.len();
            let num_chars = if i == 0 || !is_last {
                page_capacity
            } else {
                remaining
            };
            if i > 0 && !is_last {
                remaining = remaining.saturating_sub(page_capacity);
            }

            let mut acc = accessor::Accessor::new(self.store.as_mut());
            for w in 0..data_words {
                acc.set_word(accessor::Target::Sector(vda), w as isize, 0)?;
            }
            acc.set_word(accessor::Target::Sector(vda), geom.label_idx(geom.label.num_chars), num_chars as u16)?;
            acc.set_word(accessor::Target::Sector(vda), geom.label_idx(geom.label.page_number), i as u16)?;
            set_fid(&mut acc, &geom, vda, fid)?;
            drop(acc);

            let next = vdas.get(i + 1).copied();
            let prev = if i == 0 { None } else { Some(vdas[i - 1]) };
            self.link_page(vda, prev, next)?;
        }

        let leader = vdas[0];
        let last_vda = *vdas.last().unwrap();
        let last_page_number = (vdas.len() - 1) as u16;
        let last_num_chars = {
            let geom = self.store.geometry().clone();
            let mut acc = accessor::Accessor::new(self.store.as_mut());
            acc.get_word(accessor::Target::Sector(last_vda), geom.label_idx(geom.label.num_chars))?
        };
        {
            let mut acc = accessor::Accessor::new(self.store.as_mut());
            accessor::write_bcpl_string(&mut acc, accessor::Target::Sector(leader), NAME_OFFSET, &name)?;
            acc.set_word(accessor::Target::Sector(leader), PROPERTY_OFFSET, (26u16 << 8) | 210)?;
            acc.set_word(accessor::Target::Sector(leader), HINT_LAST_PAGE_FA_OFFSET, last_vda as u16)?;
            acc.set_word(accessor::Target::Sector(leader), HINT_LAST_PAGE_FA_OFFSET + 1, last_page_number)?;
            acc.set_word(accessor::Target::Sector(leader), HINT_LAST_PAGE_FA_OFFSET + 2, last_num_chars)?;
        }

        let fp = FilePointer { serial_hi, serial_lo, version: 1, leader_vda: leader };
        self.directory.add(self.store.as_mut(), &name, fp)?;
        debug!("created `{}`: {} pages starting at VDA {}", name, vdas.len(), leader);
        FileView::by_leader(self.store.as_mut(), leader).map_err(Error::from)
    }

    fn allocate_checked(&mut self) -> Result<usize, Error> {
        let vda = self.descriptor.allocate(self.store.as_mut())?;
        let geom = self.store.geometry().clone();
        let mut acc = accessor::Accessor::new(self.store.as_mut());
        let fid = get_fid(&mut acc, &geom, vda)?;
        if fid != Fid::FREE {
            warn!("invariant violation: allocated page {} did not carry a free FID", vda);
        }
        Ok(vda)
    }

    fn link_page(&mut self, vda: usize, prev: Option<usize>, next: Option<usize>) -> Result<(), Error> {
        let geom = self.store.geometry().clone();
        let family = geom.family;
        let mut acc = accessor::Accessor::new(self.store.as_mut());
        let next_da = match next {
            Some(v) => geom.vda_to_da(v)?,
            None => crate::img::DA::zero(family),
        };
        let prev_da = match prev {
            Some(v) => geom.vda_to_da(v)?,
            None => crate::img::DA::zero(family),
        };
        set_da(&mut acc, &geom, vda, geom.label.next_da, next_da)?;
        set_da(&mut acc, &geom, vda, geom.label.previous_da, prev_da)?;
        Ok(())
    }

    /// Resolve `name`, free every page, zero its labels except `FID =
    /// (-1,-1,-1)`, and remove the directory entry.  Returns `false` if the
    /// name was absent (spec.md §4.7, no error on a missing name).
    pub fn delete_file(&mut self, name: &str) -> Result<bool, Error> {
        let view = match self.open_file(name)? {
            Some(v) => v,
            None => return Ok(false),
        };
        let geom = self.store.geometry().clone();
        for &vda in &view.vdas {
            self.descriptor.free(self.store.as_mut(), vda)?;
            let mut acc = accessor::Accessor::new(self.store.as_mut());
            for w in 0..geom.label_words {
                let off = geom.label_idx(w) ;
                acc.set_word(accessor::Target::Sector(vda), off, 0)?;
            }
            set_fid(&mut acc, &geom, vda, Fid::FREE)?;
        }
        self.directory.remove(self.store.as_mut(), name)?;
        debug!("deleted `{}`: freed {} pages", name, view.vdas.len());
        Ok(true)
    }

    /// Walk invariants I1-I5 (spec.md §3) and report, never repair (beyond
    /// the free-count reconciliation already performed on `mount`).
    pub fn check(&mut self) -> Result<Vec<CheckFinding>, Error> {
        let mut findings = Vec::new();
        if let Some((stored, counted)) = self.free_count_reconciliation {
            findings.push(CheckFinding::FreeCountReconciled { stored, counted });
        }
        let geom = self.store.geometry().clone();
        let n_vdas = geom.n_vdas();

        for vda in 0..n_vdas {
            let free = self.descriptor.is_page_free(self.store.as_mut(), vda)?;
            if free {
                let fid = {
                    let mut acc = accessor::Accessor::new(self.store.as_mut());
                    get_fid(&mut acc, &geom, vda)?
                };
                if fid != Fid::FREE {
                    findings.push(CheckFinding::FreeVdaNotMarkedFree { vda });
                }
            }
        }

        for entry in self.directory.list(self.store.as_mut())? {
            let view = FileView::by_leader(self.store.as_mut(), entry.fp.leader_vda)?;
            for &vda in &view.vdas {
                if self.descriptor.is_page_free(self.store.as_mut(), vda)? {
                    findings.push(CheckFinding::ReachableVdaMarkedFree { vda, file: entry.name.clone() });
                }
            }
        }

        for finding in &findings {
            warn!("consistency check: {:?}", finding);
        }
        Ok(findings)
    }

    /// Flush buffered writes and close the host handle(s) (spec.md §5).
    pub fn close(mut self) -> std::io::Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::img::{DA, Geometry};
    use std::io::Write;

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
            Err(ImgError::SecondDriveMissing("test fixture has no sibling".to_string()))
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn link(acc: &mut accessor::Accessor<'_>, geom: &Geometry, vda: usize, next: Option<usize>, prev: Option<usize>, num_chars: usize, page_number: u16) {
        let next_da = match next {
            Some(v) => geom.vda_to_da(v).unwrap(),
            None => DA::zero(geom.family),
        };
        let prev_da = match prev {
            Some(v) => geom.vda_to_da(v).unwrap(),
            None => DA::zero(geom.family),
        };
        set_da(acc, geom, vda, geom.label.next_da, next_da).unwrap();
        set_da(acc, geom, vda, geom.label.previous_da, prev_da).unwrap();
        acc.set_word(accessor::Target::Sector(vda), geom.label_idx(geom.label.num_chars), num_chars as u16).unwrap();
        acc.set_word(accessor::Target::Sector(vda), geom.label_idx(geom.label.page_number), page_number).unwrap();
    }

    /// Build a minimal valid small-family image: `SysDir.` (leader VDA 1 + one
    /// data page) holding a used entry for `DiskDescriptor.` plus a trailing
    /// free entry, and `DiskDescriptor.` (leader VDA 2 + two data pages,
    /// enough to hold a full free-page bitmap) with geometry filled in and
    /// every VDA free.  Enough to exercise mount/create/delete end-to-end.
    fn build_image() -> tempfile::TempPath {
        let geometry = Geometry::small(1, 203);
        let data_words = geometry.data_words;
        let n_vdas = geometry.n_vdas();
        let mut store = MemStore { sectors: vec![vec![0u8; geometry.sector_bytes()]; n_vdas], geometry: geometry.clone() };

        let sysdir_leader = 1usize;
        let sysdir_data = 10usize;
        let dd_leader = 2usize;
        let dd_data1 = 11usize;
        let dd_data2 = 12usize;

        let mut acc = accessor::Accessor::new(&mut store);

        link(&mut acc, &geometry, sysdir_leader, Some(sysdir_data), None, 2 * data_words, 0);
        link(&mut acc, &geometry, sysdir_data, None, Some(sysdir_leader), 2 * data_words - 1, 1);

        let dd_name = "DiskDescriptor.";
        let needed = 1 + 5 + (dd_name.len() + 2).div_ceil(2);
        let remaining = data_words - needed;
        let fp = [0u16, 0u16, 1u16, 0u16, dd_leader as u16];
        for (j, word) in fp.iter().enumerate() {
            acc.set_word(accessor::Target::File(&[sysdir_leader, sysdir_data]), (j + 1) as isize, *word).unwrap();
        }
        accessor::write_bcpl_string(&mut acc, accessor::Target::File(&[sysdir_leader, sysdir_data]), 6, dd_name).unwrap();
        acc.set_word(accessor::Target::File(&[sysdir_leader, sysdir_data]), 0, (1u16 << 10) | needed as u16).unwrap();
        acc.set_word(accessor::Target::File(&[sysdir_leader, sysdir_data]), needed as isize, remaining as u16).unwrap();

        link(&mut acc, &geometry, dd_leader, Some(dd_data1), None, 2 * data_words, 0);
        let bitmap_words = n_vdas.div_ceil(16);
        let second_page_words = 16 + bitmap_words - data_words;
        link(&mut acc, &geometry, dd_data1, Some(dd_data2), Some(dd_leader), 2 * data_words, 1);
        link(&mut acc, &geometry, dd_data2, None, Some(dd_data1), 2 * second_page_words, 2);

        let dd_vdas = [dd_leader, dd_data1, dd_data2];
        acc.set_word(accessor::Target::File(&dd_vdas), 0, geometry.n_disks as u16).unwrap();
        acc.set_word(accessor::Target::File(&dd_vdas), 1, geometry.n_tracks as u16).unwrap();
        acc.set_word(accessor::Target::File(&dd_vdas), 2, geometry.n_heads as u16).unwrap();
        acc.set_word(accessor::Target::File(&dd_vdas), 3, geometry.n_sectors as u16).unwrap();

        // Mark the pages this fixture already occupies as in-use, or `create_file`
        // would be free to hand one of them straight back out.
        let occupied = [sysdir_leader, sysdir_data, dd_leader, dd_data1, dd_data2];
        for &used_vda in &occupied {
            let word_idx = 16 + used_vda / 16;
            let bit: u16 = 15 - (used_vda % 16) as u16;
            let word = acc.get_word(accessor::Target::File(&dd_vdas), word_idx as isize).unwrap();
            acc.set_word(accessor::Target::File(&dd_vdas), word_idx as isize, word | (1 << bit)).unwrap();
        }
        acc.set_word(accessor::Target::File(&dd_vdas), 9, (n_vdas - occupied.len()) as u16).unwrap();
        drop(acc);

        let mut bytes = Vec::with_capacity(n_vdas * geometry.sector_bytes());
        for s in &store.sectors {
            bytes.extend_from_slice(s);
        }
        let mut f = tempfile::Builder::new().suffix(".dsk").tempfile().unwrap();
        f.write_all(&bytes).unwrap();
        f.into_temp_path()
    }

    #[test]
    fn mount_lists_only_the_disk_descriptor() {
        let _ = env_logger::try_init();
        let path = build_image();
        let mut fs = FileSystem::mount(path.to_str().unwrap(), FileSystemOptions::default()).unwrap();
        assert_eq!(fs.list().unwrap(), vec!["DiskDescriptor.".to_string()]);
    }

    #[test]
    fn create_then_lookup_then_delete_round_trips() {
        let path = build_image();
        let mut fs = FileSystem::mount(path.to_str().unwrap(), FileSystemOptions::default()).unwrap();
        fs.create_file("tmp.", 0).unwrap();
        assert!(fs.list().unwrap().contains(&"tmp.".to_string()));
        assert!(fs.open_file("tmp.").unwrap().is_some());
        assert!(fs.delete_file("tmp.").unwrap());
        assert!(fs.open_file("tmp.").unwrap().is_none());
    }

    #[test]
    fn delete_missing_name_returns_false() {
        let path = build_image();
        let mut fs = FileSystem::mount(path.to_str().unwrap(), FileSystemOptions::default()).unwrap();
        assert!(!fs.delete_file("nope.").unwrap());
    }
}
