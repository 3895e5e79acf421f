//! Component C: Word/Byte Accessor.
//!
//! A single abstraction over two backings: a sector identified by VDA, or a
//! file identified by its ordered page list.  Both funnel through one
//! byte-swap point (`word_at`/`set_word_at`), matching spec.md §4.3.
//!
//! Sector backing: `idx >= 0` addresses a data word; `idx < 0` addresses a
//! label word, with `idx == word_in_label - label_words` (see
//! `Geometry::label_idx`).  File backing: `idx` is a word index into the
//! concatenated data pages, excluding the leader; `idx == -data_words`
//! addresses the first word of the leader page.

use crate::img::backing::SectorStore;
use crate::img::Error as ImgError;

/// Which of the two backings an `Accessor` call targets.
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// A single sector, named by VDA.
    Sector(usize),
    /// An ordered file page list (leader first).
    File(&'a [usize]),
}

/// Word/byte accessor over a `SectorStore`.  Does not own the store; every
/// call borrows it for the duration of the call only, so a large-family
/// single-sector cache never has its buffer outlive the next `get`.
pub struct Accessor<'s> {
    store: &'s mut dyn SectorStore,
}

impl<'s> Accessor<'s> {
    pub fn new(store: &'s mut dyn SectorStore) -> Self {
        Accessor { store }
    }

    /// Resolve a `Target`+`idx` pair to the (vda, within-sector word index) it names.
    fn locate(&self, target: Target, idx: isize) -> Result<(usize, usize), ImgError> {
        let geom = self.store.geometry();
        match target {
            Target::Sector(vda) => {
                let within = if idx >= 0 {
                    geom.header_words + geom.label_words + idx as usize
                } else {
                    let label_word = (idx + geom.label_words as isize) as usize;
                    geom.header_words + label_word
                };
                Ok((vda, within))
            }
            Target::File(vdas) => {
                let data_words = geom.data_words as isize;
                let page = idx.div_euclid(data_words) + 1;
                let within_page = idx.rem_euclid(data_words) as usize;
                if page < 0 || page as usize >= vdas.len() {
                    return Err(ImgError::BadAddress(idx as usize));
                }
                Ok((vdas[page as usize], geom.header_words + geom.label_words + within_page))
            }
        }
    }

    pub fn get_word(&mut self, target: Target, idx: isize) -> Result<u16, ImgError> {
        let (vda, within) = self.locate(target, idx)?;
        let sector = self.store.get(vda, false)?;
        let byte_off = (within + 1) * 2; // +1 skips the bookkeeping word
        Ok(u16::from_le_bytes([sector[byte_off], sector[byte_off + 1]]))
    }

    pub fn set_word(&mut self, target: Target, idx: isize, value: u16) -> Result<(), ImgError> {
        let (vda, within) = self.locate(target, idx)?;
        let sector = self.store.get(vda, true)?;
        let byte_off = (within + 1) * 2;
        let bytes = value.to_le_bytes();
        sector[byte_off] = bytes[0];
        sector[byte_off + 1] = bytes[1];
        Ok(())
    }

    pub fn get_byte(&mut self, target: Target, idx: isize) -> Result<u8, ImgError> {
        let word = self.get_word(target, idx.div_euclid(2))?;
        Ok(if idx.rem_euclid(2) == 0 { (word >> 8) as u8 } else { (word & 0xFF) as u8 })
    }

    pub fn set_byte(&mut self, target: Target, idx: isize, b: u8) -> Result<(), ImgError> {
        let word_idx = idx.div_euclid(2);
        let word = self.get_word(target, word_idx)?;
        let new_word = if idx.rem_euclid(2) == 0 { (word & 0x00FF) | ((b as u16) << 8) } else { (word & 0xFF00) | b as u16 };
        self.set_word(target, word_idx, new_word)
    }
}

/// Read a BCPL string: first byte is length `L`, characters packed two per
/// word with character `i` at the byte chosen by `i XOR 1` (spec.md §4.3,
/// GLOSSARY).  `base` is the accessor index of the word holding the length
/// in its high byte (and, per the packing, character 0 in its low byte).
pub fn read_bcpl_string(acc: &mut Accessor, target: Target, base: isize) -> Result<String, ImgError> {
    let header = acc.get_word(target, base)?;
    let len = (header >> 8) as usize;
    let mut bytes = Vec::with_capacity(len);
    for ci in 0..len {
        let w = acc.get_word(target, base + ((ci + 1) / 2) as isize)?;
        let b = if ci % 2 == 0 { (w & 0xFF) as u8 } else { (w >> 8) as u8 };
        bytes.push(b);
    }
    Ok(bytes.into_iter().map(|b| b as char).collect())
}

/// Write a BCPL string, mirroring `read_bcpl_string`'s packing exactly.
pub fn write_bcpl_string(acc: &mut Accessor, target: Target, base: isize, s: &str) -> Result<(), ImgError> {
    let bytes: Vec<u8> = s.chars().map(|c| c as u32 as u8).collect();
    let mut w: u16 = (bytes.len() as u16) << 8;
    for (ci, &b) in bytes.iter().enumerate() {
        if ci % 2 == 0 {
            w += b as u16;
        } else {
            w = (b as u16) << 8;
        }
        acc.set_word(target, base + ((ci + 1) / 2) as isize, w)?;
    }
    Ok(())
}
