//! Component D: File View.
//!
//! Given a leader VDA (or a name resolved through the directory), walks the
//! label chain to build an ordered page list and derive the logical length.
//! A `FileView` is a transient snapshot: it owns no storage, it is rebuilt
//! from the live sectors on every construction.

use log::warn;

use crate::img::backing::SectorStore;
use crate::img::{Error as ImgError, DA};

use super::accessor::{read_bcpl_string, Accessor, Target};

/// Leader data-block word offsets, spec.md §3/§6.
pub const NAME_OFFSET: isize = 6;
pub const PROPERTY_OFFSET: isize = 246;
pub const HINT_LAST_PAGE_FA_OFFSET: isize = 253;

/// A file's identity triple.  `(0xFFFF, 0xFFFF, 0xFFFF)` marks a free page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fid {
    pub version: u16,
    pub serial_hi: u16,
    pub serial_lo: u16,
}

impl Fid {
    pub const FREE: Fid = Fid { version: 0xFFFF, serial_hi: 0xFFFF, serial_lo: 0xFFFF };
}

pub struct FileView {
    pub leader_vda: usize,
    pub name: String,
    pub vdas: Vec<usize>,
    /// Logical byte length, leader excluded (spec.md §3).
    pub length: usize,
}

impl FileView {
    /// Walk the label chain starting at `leader_vda`, collecting the ordered page
    /// list and logical length.  Non-fatal: a non-terminal page whose `numChars`
    /// is not `2*data_words` is warned (`Error::InvariantViolation`), not raised.
    pub fn by_leader(store: &mut dyn SectorStore, leader_vda: usize) -> Result<Self, ImgError> {
        let geom = store.geometry().clone();
        let data_words = geom.data_words;
        let mut vdas = vec![leader_vda];
        let mut total_chars: usize = 0;
        let mut vda = leader_vda;
        let name;
        loop {
            let mut acc = Accessor::new(store);
            let num_chars = acc.get_word(Target::Sector(vda), geom.label_idx(geom.label.num_chars))? as usize;
            total_chars += num_chars;
            let next_da = get_da(&mut acc, &geom, vda, geom.label.next_da)?;
            if next_da.is_zero() {
                break;
            }
            if num_chars != 2 * data_words {
                warn!("invariant violation: page {} has numChars {} but is not the last page", vda, num_chars);
            }
            let next_vda = geom.da_to_vda(next_da)?;
            vdas.push(next_vda);
            vda = next_vda;
        }
        {
            let mut acc = Accessor::new(store);
            name = read_bcpl_string(&mut acc, Target::Sector(leader_vda), NAME_OFFSET)?;
        }
        Ok(FileView { leader_vda, name, vdas, length: total_chars.saturating_sub(2 * data_words) })
    }
}

fn get_da(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize, word_offset: usize) -> Result<DA, ImgError> {
    let off = geom.label_idx(word_offset);
    match geom.family {
        crate::img::Family::Small => Ok(DA::Small(acc.get_word(Target::Sector(vda), off)?)),
        crate::img::Family::Large => {
            let a = acc.get_word(Target::Sector(vda), off)?;
            let b = acc.get_word(Target::Sector(vda), off + 1)?;
            Ok(DA::Large { track: a, head_sector: b })
        }
    }
}

pub fn set_da(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize, word_offset: usize, da: DA) -> Result<(), ImgError> {
    let off = geom.label_idx(word_offset);
    match da {
        DA::Small(w) => acc.set_word(Target::Sector(vda), off, w),
        DA::Large { track, head_sector } => {
            acc.set_word(Target::Sector(vda), off, track)?;
            acc.set_word(Target::Sector(vda), off + 1, head_sector)
        }
    }
}

pub fn get_next_da(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize) -> Result<DA, ImgError> {
    get_da(acc, geom, vda, geom.label.next_da)
}

pub fn get_previous_da(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize) -> Result<DA, ImgError> {
    get_da(acc, geom, vda, geom.label.previous_da)
}

pub fn get_fid(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize) -> Result<Fid, ImgError> {
    let version = acc.get_word(Target::Sector(vda), geom.label_idx(geom.label.fid_version))?;
    let serial_hi = acc.get_word(Target::Sector(vda), geom.label_idx(geom.label.fid_serial))?;
    let serial_lo = acc.get_word(Target::Sector(vda), geom.label_idx(geom.label.fid_serial + 1))?;
    Ok(Fid { version, serial_hi, serial_lo })
}

pub fn set_fid(acc: &mut Accessor, geom: &crate::img::Geometry, vda: usize, fid: Fid) -> Result<(), ImgError> {
    acc.set_word(Target::Sector(vda), geom.label_idx(geom.label.fid_version), fid.version)?;
    acc.set_word(Target::Sector(vda), geom.label_idx(geom.label.fid_serial), fid.serial_hi)?;
    acc.set_word(Target::Sector(vda), geom.label_idx(geom.label.fid_serial + 1), fid.serial_lo)
}

/// Stream the first `length` bytes of the file as text, translating CR to LF
/// (spec.md §4.4).  The accumulator is initialized empty up front; the
/// source this crate is grounded on reads this loop with an uninitialized
/// accumulator, a latent bug this corrects.
pub fn read_as_string(store: &mut dyn SectorStore, view: &FileView) -> Result<String, ImgError> {
    let mut acc = Accessor::new(store);
    let mut s = String::with_capacity(view.length);
    for ci in 0..view.length {
        let byte = acc.get_byte(Target::File(&view.vdas), ci as isize)?;
        let ch = if byte == 0x0D { 0x0A } else { byte };
        s.push(ch as char);
    }
    Ok(s)
}
