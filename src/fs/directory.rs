//! Component E: Directory.
//!
//! `SysDir.` (leader VDA 1) is an ordinary file whose byte stream is a
//! sequence of variable-length entries: one header word `(typeCode<<10) |
//! length`, `typeCode=1` used / `0` free, followed (when used) by a 5-word
//! file pointer and a packed name (spec.md §3/§4.5).

use log::{debug, trace};

use crate::img::backing::SectorStore;
use crate::img::Error as ImgError;

use super::accessor::{read_bcpl_string, write_bcpl_string, Accessor, Target};
use super::file_view::FileView;
use super::Error;

const TYPE_FREE: u16 = 0;
const TYPE_USED: u16 = 1;
const COALESCE_LIMIT: u32 = 1000;
const SPLIT_THRESHOLD: usize = 10;

/// A 5-word directory file pointer: `(serialHi, serialLo, version, 0, leaderVDA)`.
#[derive(Clone, Copy, Debug)]
pub struct FilePointer {
    pub serial_hi: u16,
    pub serial_lo: u16,
    pub version: u16,
    pub leader_vda: usize,
}

impl FilePointer {
    fn to_words(self) -> [u16; 5] {
        [self.serial_hi, self.serial_lo, self.version, 0, self.leader_vda as u16]
    }
    fn from_words(w: [u16; 5]) -> Self {
        FilePointer { serial_hi: w[0], serial_lo: w[1], version: w[2], leader_vda: w[4] as usize }
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub fp: FilePointer,
}

/// The directory file's page list, fixed at open time (the directory never
/// grows beyond the pages a disk's formatting already gave it).
pub struct Directory {
    vdas: Vec<usize>,
    length_words: usize,
}

impl Directory {
    pub fn open(store: &mut dyn SectorStore) -> Result<Self, ImgError> {
        let view = FileView::by_leader(store, 1)?;
        Ok(Directory { vdas: view.vdas, length_words: view.length / 2 })
    }

    fn header(&self, acc: &mut Accessor, idx: usize) -> Result<(u16, u16), ImgError> {
        let w = acc.get_word(Target::File(&self.vdas), idx as isize)?;
        Ok((w >> 10, w & 0x3FF))
    }

    fn set_header(&self, acc: &mut Accessor, idx: usize, type_code: u16, length: u16) -> Result<(), ImgError> {
        acc.set_word(Target::File(&self.vdas), idx as isize, (type_code << 10) | length)
    }

    fn read_name(&self, acc: &mut Accessor, idx: usize) -> Result<String, ImgError> {
        read_bcpl_string(acc, Target::File(&self.vdas), (idx + 6) as isize)
    }

    fn read_fp(&self, acc: &mut Accessor, idx: usize) -> Result<FilePointer, ImgError> {
        let mut w = [0u16; 5];
        for (j, slot) in w.iter_mut().enumerate() {
            *slot = acc.get_word(Target::File(&self.vdas), (idx + 1 + j) as isize)?;
        }
        Ok(FilePointer::from_words(w))
    }

    /// Find the entry index matching `name` (already normalised), or `None`
    /// at end-of-allocated-area (spec.md §4.5's "length==0 or past length/2").
    fn find(&self, acc: &mut Accessor, name: &str) -> Result<Option<usize>, ImgError> {
        let mut idx = 0usize;
        loop {
            if idx >= self.length_words {
                return Ok(None);
            }
            let (type_code, length) = self.header(acc, idx)?;
            if length == 0 {
                return Ok(None);
            }
            if type_code == TYPE_USED {
                let entry_name = self.read_name(acc, idx)?;
                if entry_name.eq_ignore_ascii_case(name) {
                    return Ok(Some(idx));
                }
            }
            trace!("directory scan: entry at {} type {} length {}", idx, type_code, length);
            idx += length as usize;
        }
    }

    pub fn lookup(&self, store: &mut dyn SectorStore, name: &str) -> Result<Option<DirEntry>, Error> {
        let name = normalize(name);
        let mut acc = Accessor::new(store);
        match self.find(&mut acc, &name)? {
            None => Ok(None),
            Some(idx) => Ok(Some(DirEntry { name: self.read_name(&mut acc, idx)?, fp: self.read_fp(&mut acc, idx)? })),
        }
    }

    pub fn list(&self, store: &mut dyn SectorStore) -> Result<Vec<DirEntry>, Error> {
        let mut acc = Accessor::new(store);
        let mut out = Vec::new();
        let mut idx = 0usize;
        loop {
            if idx >= self.length_words {
                break;
            }
            let (type_code, length) = self.header(&mut acc, idx)?;
            if length == 0 {
                break;
            }
            if type_code == TYPE_USED {
                out.push(DirEntry { name: self.read_name(&mut acc, idx)?, fp: self.read_fp(&mut acc, idx)? });
            }
            idx += length as usize;
        }
        Ok(out)
    }

    /// Flip the matching entry to free, coalescing forward with an
    /// immediately-following free entry when the combined length stays under
    /// `COALESCE_LIMIT` words (spec.md §4.5). No backward coalesce.
    pub fn remove(&self, store: &mut dyn SectorStore, name: &str) -> Result<bool, Error> {
        let name = normalize(name);
        let mut acc = Accessor::new(store);
        let idx = match self.find(&mut acc, &name)? {
            Some(i) => i,
            None => return Ok(false),
        };
        let (_, this_len) = self.header(&mut acc, idx)?;
        let mut new_len = this_len;
        let next_idx = idx + this_len as usize;
        if next_idx < self.length_words {
            let (next_type, next_len) = self.header(&mut acc, next_idx)?;
            if next_len != 0 && next_type == TYPE_FREE && (this_len as u32 + next_len as u32) < COALESCE_LIMIT {
                new_len = this_len + next_len;
            }
        }
        self.set_header(&mut acc, idx, TYPE_FREE, new_len)?;
        debug!("directory: removed `{}`, freed entry at {} ({} words)", name, idx, new_len);
        Ok(true)
    }

    /// First-fit insert.  `needed = 1 + |FP| + ceil((|name|+2)/2)` words
    /// (spec.md §4.5); splits the matched free entry unless the remainder
    /// would be smaller than `SPLIT_THRESHOLD` words, in which case the
    /// whole entry is consumed.
    pub fn add(&self, store: &mut dyn SectorStore, name: &str, fp: FilePointer) -> Result<(), Error> {
        let name = normalize(name);
        // spec.md's ceiling division, not altofs.py's floor division -- the two
        // differ by one word for odd-length normalised names.
        let needed = 1 + 5 + (name.len() + 2).div_ceil(2);
        let mut acc = Accessor::new(store);
        let mut idx = 0usize;
        loop {
            if idx >= self.length_words {
                return Err(Error::DirectoryFull(name));
            }
            let (type_code, length) = self.header(&mut acc, idx)?;
            if length == 0 {
                return Err(Error::DirectoryFull(name));
            }
            if type_code == TYPE_FREE && (length as usize) >= needed {
                for (j, word) in fp.to_words().iter().enumerate() {
                    acc.set_word(Target::File(&self.vdas), (idx + 1 + j) as isize, *word)?;
                }
                write_bcpl_string(&mut acc, Target::File(&self.vdas), (idx + 6) as isize, &name)?;
                let remaining = length as usize - needed;
                if remaining < SPLIT_THRESHOLD {
                    self.set_header(&mut acc, idx, TYPE_USED, length)?;
                } else {
                    self.set_header(&mut acc, idx, TYPE_USED, needed as u16)?;
                    self.set_header(&mut acc, idx + needed, TYPE_FREE, remaining as u16)?;
                }
                debug!("directory: added `{}` at entry {} ({} words)", name, idx, needed);
                return Ok(());
            }
            idx += length as usize;
        }
    }
}

/// Append a trailing `.` if the caller didn't supply one (spec.md §4.4/§4.5).
pub fn normalize(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
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
            unimplemented!()
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Build a two-page directory (leader VDA 1, one data page at VDA 2) with
    /// a single free entry spanning the data page, wired up as `SysDir.`
    /// would be.  File content lives in the data page, never the leader's
    /// own data region (spec.md §4.3's file backing excludes the leader).
    fn mem_store_with_empty_directory() -> MemStore {
        let geometry = Geometry::small(1, 203);
        let data_words = geometry.data_words;
        let mut store = MemStore { sectors: vec![vec![0u8; geometry.sector_bytes()]; 4], geometry: geometry.clone() };
        let leader_vda = 1usize;
        let data_vda = 2usize;
        {
            let mut acc = Accessor::new(&mut store);
            let da = geometry.vda_to_da(data_vda).unwrap();
            super::file_view::set_da(&mut acc, &geometry, leader_vda, geometry.label.next_da, da).unwrap();
            acc.set_word(Target::Sector(leader_vda), geometry.label_idx(geometry.label.num_chars), (2 * data_words) as u16).unwrap();

            acc.set_word(Target::Sector(data_vda), geometry.label_idx(geometry.label.num_chars), (2 * data_words - 2) as u16).unwrap();
            acc.set_word(Target::Sector(data_vda), geometry.label_idx(geometry.label.page_number), 1).unwrap();
            acc.set_word(Target::File(&[leader_vda, data_vda]), 0, (TYPE_FREE << 10) | (data_words as u16 - 1)).unwrap();
        }
        store
    }

    #[test]
    fn add_then_lookup_then_remove() {
        let _ = env_logger::try_init();
        let mut store = mem_store_with_empty_directory();
        let dir = Directory::open(&mut store).unwrap();
        let fp = FilePointer { serial_hi: 0, serial_lo: 7, version: 1, leader_vda: 3 };
        dir.add(&mut store, "Foo", fp).unwrap();

        let found = dir.lookup(&mut store, "FOO.").unwrap().expect("case-insensitive lookup");
        assert_eq!(found.name, "Foo.");
        assert_eq!(found.fp.leader_vda, 3);

        assert!(dir.remove(&mut store, "foo").unwrap());
        assert!(dir.lookup(&mut store, "foo").unwrap().is_none());
    }

    #[test]
    fn missing_name_is_none() {
        let mut store = mem_store_with_empty_directory();
        let dir = Directory::open(&mut store).unwrap();
        assert!(dir.lookup(&mut store, "nope.").unwrap().is_none());
        assert!(!dir.remove(&mut store, "nope.").unwrap());
    }

    #[test]
    fn directory_full_when_entry_too_small() {
        let mut store = mem_store_with_empty_directory();
        let dir = Directory::open(&mut store).unwrap();
        // shrink the single free entry to smaller than any real name needs.
        {
            let mut acc = Accessor::new(&mut store);
            dir.set_header(&mut acc, 0, TYPE_FREE, 3).unwrap();
        }
        let fp = FilePointer { serial_hi: 0, serial_lo: 1, version: 1, leader_vda: 2 };
        assert!(matches!(dir.add(&mut store, "too.long.a.name.", fp), Err(Error::DirectoryFull(_))));
    }
}
