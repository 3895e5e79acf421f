//! Component A: Image Backing Store.
//!
//! Two strategies share one contract (`SectorStore`): the small family slurps
//! the whole image into memory, the large family keeps a single resident
//! sector buffer and seeks on every miss, self-checking the header against
//! the requested VDA (spec.md §4.1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::info;

use super::{Error, Geometry, DA};

/// Uniform contract over the small- and large-family backings: fetch a mutable
/// sector buffer by VDA.  Callers must not retain the slice returned by `get`
/// across another call to `get` -- the large family's single-buffer cache
/// depends on this.
pub trait SectorStore {
    fn geometry(&self) -> &Geometry;
    /// Return the raw bytes of sector `vda`: bookkeeping word, header, label, data.
    fn get(&mut self, vda: usize, writable: bool) -> Result<&mut [u8], Error>;
    /// Attach a sibling drive image (small family only).  Large family always fails.
    fn attach_second_drive(&mut self) -> Result<(), Error>;
    /// Flush all buffered writes and release the host file handle(s).
    fn close(&mut self) -> std::io::Result<()>;
}

/// Select a family and open its backing store for `path`, per spec.md §4.1.
pub fn open(path: &str) -> Result<Box<dyn SectorStore>, Error> {
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    let size = std::fs::metadata(path).map(|m| m.len() as usize).map_err(|_| Error::UnknownGeometry)?;
    if ext == "dsk" {
        if let Some((n_disks, n_tracks)) = small_config_for_size(size) {
            info!("identified small-family image: {} disk(s), {} tracks", n_disks, n_tracks);
            return Ok(Box::new(SmallBacking::open(path, n_disks, n_tracks)?));
        }
    }
    if ext == "dsk80" {
        let geom = Geometry::large();
        if geom.n_vdas() * geom.sector_bytes() == size {
            info!("identified large-family image");
            return Ok(Box::new(LargeBacking::open(path)?));
        }
    }
    Err(Error::UnknownGeometry)
}

fn small_config_for_size(size_bytes: usize) -> Option<(usize, usize)> {
    for n_tracks in [203usize, 406usize] {
        for n_disks in [1usize, 2usize] {
            let geom = Geometry::small(n_disks, n_tracks);
            if geom.n_vdas() * geom.sector_bytes() == size_bytes {
                return Some((n_disks, n_tracks));
            }
        }
    }
    None
}

/// Small family: the whole image lives in memory, one `Vec<u8>` per sector.
pub struct SmallBacking {
    geometry: Geometry,
    sectors: Vec<Vec<u8>>,
    primary_path: String,
    secondary_path: Option<String>,
}

impl SmallBacking {
    fn open(path: &str, n_disks: usize, n_tracks: usize) -> Result<Self, Error> {
        let geometry = Geometry::small(n_disks, n_tracks);
        let bytes = std::fs::read(path).map_err(|_| Error::UnknownGeometry)?;
        let sec_bytes = geometry.sector_bytes();
        let n = geometry.n_vdas();
        if bytes.len() != n * sec_bytes {
            return Err(Error::UnknownGeometry);
        }
        let sectors = (0..n).map(|i| bytes[i * sec_bytes..(i + 1) * sec_bytes].to_vec()).collect();
        Ok(SmallBacking { geometry, sectors, primary_path: path.to_string(), secondary_path: None })
    }
}

impl SectorStore for SmallBacking {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn get(&mut self, vda: usize, _writable: bool) -> Result<&mut [u8], Error> {
        self.sectors.get_mut(vda).map(|s| s.as_mut_slice()).ok_or(Error::BadAddress(vda))
    }

    fn attach_second_drive(&mut self) -> Result<(), Error> {
        let pos = self.primary_path.rfind('0').ok_or_else(|| Error::SecondDriveMissing(self.primary_path.clone()))?;
        let sibling = format!("{}1{}", &self.primary_path[..pos], &self.primary_path[pos + 1..]);
        let bytes = std::fs::read(&sibling).map_err(|_| Error::SecondDriveMissing(sibling.clone()))?;
        let sec_bytes = self.geometry.sector_bytes();
        let n = self.geometry.n_vdas();
        if bytes.len() != n * sec_bytes {
            return Err(Error::SecondDriveMissing(sibling));
        }
        for i in 0..n {
            self.sectors.push(bytes[i * sec_bytes..(i + 1) * sec_bytes].to_vec());
        }
        self.geometry.n_disks = 2;
        self.secondary_path = Some(sibling);
        info!("attached second drive image for {}", self.primary_path);
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        let total = self.sectors.len();
        let per_file = if self.secondary_path.is_some() { total / 2 } else { total };
        let mut f = File::create(&self.primary_path)?;
        for sector in &self.sectors[..per_file] {
            f.write_all(sector)?;
        }
        if let Some(ref secondary) = self.secondary_path {
            let mut f2 = File::create(secondary)?;
            for sector in &self.sectors[per_file..total] {
                f2.write_all(sector)?;
            }
        }
        Ok(())
    }
}

/// Large family: a single resident sector buffer, refilled (and self-checked) on each miss.
pub struct LargeBacking {
    geometry: Geometry,
    file: File,
    resident_vda: Option<usize>,
    buffer: Vec<u8>,
    dirty: bool,
}

impl LargeBacking {
    fn open(path: &str) -> Result<Self, Error> {
        let geometry = Geometry::large();
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| Error::UnknownGeometry)?;
        Ok(LargeBacking { geometry, file, resident_vda: None, buffer: Vec::new(), dirty: false })
    }

    /// Image position for `vda` within its 9-sector track group: `(v+1) mod 9` (spec.md §4.1).
    fn image_position(&self, vda: usize) -> usize {
        let n = self.geometry.n_sectors;
        let group = vda / n;
        let sector = (vda % n + 1) % n;
        group * n + sector
    }

    fn flush_resident(&mut self) -> Result<(), Error> {
        if self.dirty {
            if let Some(v) = self.resident_vda {
                let pos = (self.image_position(v) * self.geometry.sector_bytes()) as u64;
                self.file.seek(SeekFrom::Start(pos)).map_err(|_| Error::BadAddress(v))?;
                self.file.write_all(&self.buffer).map_err(|_| Error::BadAddress(v))?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn load(&mut self, vda: usize) -> Result<(), Error> {
        self.flush_resident()?;
        let pos = (self.image_position(vda) * self.geometry.sector_bytes()) as u64;
        self.file.seek(SeekFrom::Start(pos)).map_err(|_| Error::BadAddress(vda))?;
        let mut buf = vec![0u8; self.geometry.sector_bytes()];
        self.file.read_exact(&mut buf).map_err(|_| Error::BadAddress(vda))?;
        let h0 = u16::from_le_bytes([buf[2], buf[3]]);
        let h1 = u16::from_le_bytes([buf[4], buf[5]]);
        let da = DA::Large { track: h0, head_sector: h1 };
        match self.geometry.da_to_vda(da) {
            Ok(v) if v == vda => {}
            _ => return Err(Error::GeometryMismatch { field: "sector header", expected: vda, found: 0 }),
        }
        self.buffer = buf;
        self.resident_vda = Some(vda);
        Ok(())
    }
}

impl SectorStore for LargeBacking {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn get(&mut self, vda: usize, writable: bool) -> Result<&mut [u8], Error> {
        if vda >= self.geometry.n_vdas() {
            return Err(Error::BadAddress(vda));
        }
        if self.resident_vda != Some(vda) {
            self.load(vda)?;
        }
        if writable {
            self.dirty = true;
        }
        Ok(&mut self.buffer)
    }

    fn attach_second_drive(&mut self) -> Result<(), Error> {
        Err(Error::SecondDriveMissing("large-family images never span two drives".to_string()))
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.flush_resident().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_small_image(n_disks: usize, n_tracks: usize) -> (tempfile::TempPath, Geometry) {
        let geometry = Geometry::small(n_disks, n_tracks);
        let bytes = vec![0u8; geometry.n_vdas() * geometry.sector_bytes()];
        let mut f = tempfile::Builder::new().suffix(".dsk").tempfile().unwrap();
        f.write_all(&bytes).unwrap();
        (f.into_temp_path(), geometry)
    }

    #[test]
    fn small_backing_selected_by_size_and_extension() {
        let _ = env_logger::try_init();
        let (path, geometry) = blank_small_image(1, 203);
        let store = open(path.to_str().unwrap()).expect("should identify small family");
        assert_eq!(store.geometry().n_vdas(), geometry.n_vdas());
        assert_eq!(store.geometry().family, super::super::Family::Small);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let mut f = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        f.write_all(&[0u8; 16]).unwrap();
        assert!(matches!(open(f.path().to_str().unwrap()), Err(Error::UnknownGeometry)));
    }

    #[test]
    fn small_backing_roundtrips_a_written_word() {
        let (path, _geometry) = blank_small_image(1, 203);
        let mut store: Box<dyn SectorStore> = Box::new(SmallBacking::open(path.to_str().unwrap(), 1, 203).unwrap());
        {
            let sector = store.get(5, true).unwrap();
            sector[10] = 0xAB;
            sector[11] = 0xCD;
        }
        assert_eq!(store.get(5, false).unwrap()[10], 0xAB);
        store.close().unwrap();
    }
}
