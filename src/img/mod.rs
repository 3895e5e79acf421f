//! # Disk Image Module
//!
//! This module is the bottom two layers of the stack: it knows how raw bytes
//! in a host `.dsk`/`.dsk80` file are organized into sectors (`backing`), and
//! how a sector's virtual disk address (VDA) relates to the physical disk
//! address (DA) baked into its label (`Geometry`).  It has no notion of
//! files, directories, or labels beyond the geometry needed to locate a word.
//!
//! Two disk families are supported, distinguished by `Family`:
//! * `Small` -- a cartridge-disk geometry (Diablo-style), one or two drives.
//! * `Large` -- a pack-disk geometry (Trident-style), single drive, with a
//!   sector permutation quirk and a self-verifying single-sector buffer cache.

pub mod backing;

use thiserror::Error;

/// Enumerates disk image errors.  The `Display` trait prints an equivalent long message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("image size/extension does not match any known disk geometry")]
    UnknownGeometry,
    #[error("geometry mismatch in field `{field}`: descriptor says {expected}, backing store has {found}")]
    GeometryMismatch { field: &'static str, expected: usize, found: usize },
    #[error("disk descriptor requests a second drive but no sibling image was found at {0}")]
    SecondDriveMissing(String),
    #[error("address out of range: {0}")]
    BadAddress(usize),
}

/// The two physical disk families this crate understands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
    /// Cartridge-disk family: 12 sectors/track, 2 heads, 203 or 406 tracks, 1 or 2 disks.
    Small,
    /// Pack-disk family: 9 sectors/track, 5 heads, 815 tracks, 1 disk.
    Large,
}

/// Word offsets (relative to the start of a sector's label) of the fields a
/// label carries.  These differ per family (spec table in `img` module docs).
#[derive(Clone, Copy, Debug)]
pub struct LabelLayout {
    pub next_da: usize,
    pub next_da_len: usize,
    pub previous_da: usize,
    pub fid_version: usize,
    pub fid_serial: usize,
    pub num_chars: usize,
    pub page_number: usize,
}

impl LabelLayout {
    const fn small() -> Self {
        LabelLayout { next_da: 0, next_da_len: 1, previous_da: 1, fid_version: 5, fid_serial: 6, num_chars: 3, page_number: 4 }
    }
    const fn large() -> Self {
        LabelLayout { next_da: 8, next_da_len: 2, previous_da: 6, fid_version: 2, fid_serial: 0, num_chars: 4, page_number: 5 }
    }
}

/// A physical disk address, as packed inside a sector label.  All-zero means
/// "no successor / no predecessor".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DA {
    Small(u16),
    Large { track: u16, head_sector: u16 },
}

impl DA {
    pub fn zero(family: Family) -> DA {
        match family {
            Family::Small => DA::Small(0),
            Family::Large => DA::Large { track: 0, head_sector: 0 },
        }
    }
    pub fn is_zero(&self) -> bool {
        *self == DA::zero(self.family())
    }
    pub fn family(&self) -> Family {
        match self {
            DA::Small(_) => Family::Small,
            DA::Large { .. } => Family::Large,
        }
    }
}

/// Family-owned sector geometry: header/label/data word counts, disk/track/head/sector
/// counts, and the label layout.  A `Geometry` is immutable once a backing store selects it
/// (small family geometry can still grow `n_disks` from 1 to 2 on second-drive attach).
#[derive(Clone, Debug)]
pub struct Geometry {
    pub family: Family,
    pub n_disks: usize,
    pub n_tracks: usize,
    pub n_heads: usize,
    pub n_sectors: usize,
    pub header_words: usize,
    pub label_words: usize,
    pub data_words: usize,
    pub label: LabelLayout,
}

impl Geometry {
    pub fn small(n_disks: usize, n_tracks: usize) -> Self {
        Geometry {
            family: Family::Small,
            n_disks,
            n_tracks,
            n_heads: 2,
            n_sectors: 12,
            header_words: 2,
            label_words: 8,
            data_words: 256,
            label: LabelLayout::small(),
        }
    }
    pub fn large() -> Self {
        Geometry {
            family: Family::Large,
            n_disks: 1,
            n_tracks: 815,
            n_heads: 5,
            n_sectors: 9,
            header_words: 2,
            label_words: 10,
            data_words: 1024,
            label: LabelLayout::large(),
        }
    }

    pub fn n_vdas(&self) -> usize {
        self.n_disks * self.n_tracks * self.n_heads * self.n_sectors
    }

    /// Words in one sector, including the single bookkeeping word but excluding nothing else.
    pub fn sector_words(&self) -> usize {
        1 + self.header_words + self.label_words + self.data_words
    }

    pub fn sector_bytes(&self) -> usize {
        self.sector_words() * 2
    }

    /// The accessor index, relative to the start of a sector's data region, that
    /// selects label word `word_in_label` (0-based from the start of the label).
    /// Negative by construction -- see `fs::accessor`.
    pub fn label_idx(&self, word_in_label: usize) -> isize {
        word_in_label as isize - self.label_words as isize
    }

    /// VDA -> DA, per spec.md §3.  Encoding order (outermost->innermost) is
    /// disk, track, head, sector.
    pub fn vda_to_da(&self, vda: usize) -> Result<DA, Error> {
        if vda >= self.n_vdas() {
            return Err(Error::BadAddress(vda));
        }
        let sector = vda % self.n_sectors;
        let rest = vda / self.n_sectors;
        let head = rest % self.n_heads;
        let rest = rest / self.n_heads;
        let track = rest % self.n_tracks;
        let disk = rest / self.n_tracks;
        match self.family {
            Family::Small => Ok(DA::Small(
                ((sector as u16) << 12) | ((track as u16) << 3) | ((head as u16) << 2) | ((disk as u16) << 1),
            )),
            Family::Large => Ok(DA::Large { track: track as u16, head_sector: ((head as u16) << 8) | sector as u16 }),
        }
    }

    /// DA -> VDA, the inverse of `vda_to_da`.  A DA outside the geometry's range is `BadAddress`.
    pub fn da_to_vda(&self, da: DA) -> Result<usize, Error> {
        let (sector, track, head, disk) = match da {
            DA::Small(w) => (
                ((w >> 12) & 0o17) as usize,
                ((w >> 3) & 0o777) as usize,
                ((w >> 2) & 0o1) as usize,
                ((w >> 1) & 0o1) as usize,
            ),
            DA::Large { track, head_sector } => (
                (head_sector & 0xFF) as usize,
                track as usize,
                (head_sector >> 8) as usize,
                0,
            ),
        };
        if sector >= self.n_sectors || track >= self.n_tracks || head >= self.n_heads || disk >= self.n_disks {
            return Err(Error::BadAddress(self.encode_raw(disk, track, head, sector)));
        }
        Ok(((disk * self.n_tracks + track) * self.n_heads + head) * self.n_sectors + sector)
    }

    fn encode_raw(&self, disk: usize, track: usize, head: usize, sector: usize) -> usize {
        ((disk * 1000 + track) * 100 + head) * 100 + sector
    }
}
