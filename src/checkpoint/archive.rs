//! Reader for the ZIP container `torch.save` emits.
//!
//! Follows the PKZIP layout: local file headers, central directory, end of
//! central directory record (plus the ZIP64 records large checkpoints need).
//! Only STORED entries are accepted; PyTorch never compresses tensor payloads
//! and refusing a decompressor keeps the load path small. Entry CRCs are not
//! verified; every payload access is bounds-checked instead and the pickle
//! layer re-validates structure.

use crate::errors::WeightsmithError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

const LOCAL_FILE_SIG: u32 = 0x0403_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD64_SIG: u32 = 0x0606_4b50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_MIN_LEN: usize = 22;
const EOCD64_LOCATOR_LEN: usize = 20;
/// ZIP64 extended information extra field id.
const ZIP64_EXTRA_ID: u16 = 0x0001;
const METHOD_STORED: u16 = 0;

fn truncated() -> WeightsmithError {
    WeightsmithError::InvalidFormat("truncated archive".to_string())
}

/// One entry from the central directory.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    method: u16,
    size: u64,
    compressed_size: u64,
    local_header_offset: u64,
}

/// In-memory ZIP archive with STORED-entry access.
pub struct Archive {
    data: Vec<u8>,
    entries: Vec<ArchiveEntry>,
}

impl Archive {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, WeightsmithError> {
        let (entry_count, cd_offset) = find_central_directory(&data)?;
        let mut cursor = Cursor::new(&data[..]);
        cursor.set_position(cd_offset);
        let mut entries = Vec::with_capacity(entry_count.min(4096) as usize);
        for _ in 0..entry_count {
            entries.push(read_central_entry(&mut cursor)?);
        }
        Ok(Self { data, entries })
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// First entry whose name ends with `suffix`.
    pub fn find_suffix(&self, suffix: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name.ends_with(suffix))
    }

    pub fn find(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Payload bytes of an entry. Sizes come from the central directory,
    /// which stays authoritative when the writer streamed with data
    /// descriptors and zeroed the local header sizes.
    pub fn read(&self, entry: &ArchiveEntry) -> Result<&[u8], WeightsmithError> {
        if entry.method != METHOD_STORED {
            return Err(WeightsmithError::InvalidFormat(format!(
                "entry {} uses compression method {}, only stored entries are supported",
                entry.name, entry.method
            )));
        }
        if entry.compressed_size != entry.size {
            return Err(WeightsmithError::InvalidFormat(format!(
                "stored entry {} has mismatched sizes",
                entry.name
            )));
        }
        let mut cursor = Cursor::new(&self.data[..]);
        cursor.set_position(entry.local_header_offset);
        if cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? != LOCAL_FILE_SIG {
            return Err(WeightsmithError::InvalidFormat(format!(
                "entry {}: bad local header signature",
                entry.name
            )));
        }
        // version, flags, method, time, date, crc, compressed, uncompressed
        cursor.set_position(cursor.position() + 22);
        let name_len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as u64;
        let extra_len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as u64;
        let start = cursor.position() + name_len + extra_len;
        let end = start
            .checked_add(entry.size)
            .ok_or_else(|| WeightsmithError::InvalidFormat("entry size overflow".to_string()))?;
        if end > self.data.len() as u64 {
            return Err(WeightsmithError::InvalidFormat(format!(
                "entry {} extends past end of archive",
                entry.name
            )));
        }
        Ok(&self.data[start as usize..end as usize])
    }

    pub fn read_by_name(&self, name: &str) -> Result<&[u8], WeightsmithError> {
        let entry = self.find(name).ok_or_else(|| {
            WeightsmithError::InvalidFormat(format!("archive entry {} missing", name))
        })?;
        self.read(entry)
    }
}

/// Locate the central directory: scan backwards for the EOCD record, then
/// follow the ZIP64 locator when the 32-bit fields are saturated.
fn find_central_directory(data: &[u8]) -> Result<(u64, u64), WeightsmithError> {
    if data.len() < EOCD_MIN_LEN {
        return Err(truncated());
    }
    let scan_floor = data.len().saturating_sub(EOCD_MIN_LEN + u16::MAX as usize);
    let mut eocd_pos = None;
    for pos in (scan_floor..=data.len() - EOCD_MIN_LEN).rev() {
        if data[pos..pos + 4] == EOCD_SIG.to_le_bytes() {
            eocd_pos = Some(pos);
            break;
        }
    }
    let eocd_pos = eocd_pos.ok_or_else(|| {
        WeightsmithError::InvalidFormat("end of central directory record not found".to_string())
    })?;

    let mut cursor = Cursor::new(&data[eocd_pos + 4..]);
    let _disk = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    let _cd_disk = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    let _entries_this_disk = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    let entry_count = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    let _cd_size = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;
    let cd_offset = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())?;

    if entry_count != u16::MAX && cd_offset != u32::MAX {
        return Ok((entry_count as u64, cd_offset as u64));
    }

    // ZIP64: the locator sits immediately before the EOCD record.
    if eocd_pos < EOCD64_LOCATOR_LEN {
        return Err(WeightsmithError::InvalidFormat(
            "ZIP64 archive without locator record".to_string(),
        ));
    }
    let loc = eocd_pos - EOCD64_LOCATOR_LEN;
    if data[loc..loc + 4] != EOCD64_LOCATOR_SIG.to_le_bytes() {
        return Err(WeightsmithError::InvalidFormat(
            "ZIP64 locator signature missing".to_string(),
        ));
    }
    let mut cursor = Cursor::new(&data[loc + 8..]);
    let eocd64_offset = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
    if eocd64_offset + 56 > data.len() as u64 {
        return Err(truncated());
    }
    let mut cursor = Cursor::new(&data[eocd64_offset as usize..]);
    if cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? != EOCD64_SIG {
        return Err(WeightsmithError::InvalidFormat(
            "ZIP64 end of central directory signature missing".to_string(),
        ));
    }
    // record size, versions, disk numbers, entries on this disk
    cursor.set_position(cursor.position() + 28);
    let entry_count = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
    let _cd_size = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
    let cd_offset = cursor.read_u64::<LittleEndian>().map_err(|_| truncated())?;
    Ok((entry_count, cd_offset))
}

fn read_central_entry(cursor: &mut Cursor<&[u8]>) -> Result<ArchiveEntry, WeightsmithError> {
    if cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? != CENTRAL_DIR_SIG {
        return Err(WeightsmithError::InvalidFormat(
            "bad central directory signature".to_string(),
        ));
    }
    // version made by, version needed, flags, method
    cursor.set_position(cursor.position() + 6);
    let method = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?;
    // time, date, crc
    cursor.set_position(cursor.position() + 8);
    let mut compressed_size = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as u64;
    let mut size = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as u64;
    let name_len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as usize;
    let extra_len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as usize;
    let comment_len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as usize;
    // disk start, internal attrs, external attrs
    cursor.set_position(cursor.position() + 8);
    let mut local_header_offset = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as u64;

    let data = *cursor.get_ref();
    let pos = cursor.position() as usize;
    if pos + name_len + extra_len + comment_len > data.len() {
        return Err(truncated());
    }
    let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
    let extra = &data[pos + name_len..pos + name_len + extra_len];
    cursor.set_position((pos + name_len + extra_len + comment_len) as u64);

    // ZIP64 extra field carries the saturated values, in this fixed order.
    if size == u32::MAX as u64 || compressed_size == u32::MAX as u64 || local_header_offset == u32::MAX as u64 {
        let mut ex = Cursor::new(extra);
        while (ex.position() as usize) + 4 <= extra.len() {
            let id = ex.read_u16::<LittleEndian>().map_err(|_| truncated())?;
            let len = ex.read_u16::<LittleEndian>().map_err(|_| truncated())? as u64;
            let field_end = ex.position() + len;
            if id == ZIP64_EXTRA_ID {
                if size == u32::MAX as u64 {
                    size = ex.read_u64::<LittleEndian>().map_err(|_| truncated())?;
                }
                if compressed_size == u32::MAX as u64 {
                    compressed_size = ex.read_u64::<LittleEndian>().map_err(|_| truncated())?;
                }
                if local_header_offset == u32::MAX as u64 {
                    local_header_offset = ex.read_u64::<LittleEndian>().map_err(|_| truncated())?;
                }
            }
            ex.set_position(field_end);
        }
    }

    Ok(ArchiveEntry {
        name,
        method,
        size,
        compressed_size,
        local_header_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_header(name: &str, data: &[u8], method: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LOCAL_FILE_SIG.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]); // time, date, crc
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        out
    }

    fn build_zip(entries: &[(&str, &[u8], u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::new();
        for (name, data, method) in entries {
            offsets.push(out.len() as u32);
            out.extend_from_slice(&local_header(name, data, *method));
        }
        let cd_offset = out.len() as u32;
        for ((name, data, method), offset) in entries.iter().zip(&offsets) {
            out.extend_from_slice(&CENTRAL_DIR_SIG.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes()); // version made by
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]); // time, date, crc
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra
            out.extend_from_slice(&0u16.to_le_bytes()); // comment
            out.extend_from_slice(&0u16.to_le_bytes()); // disk
            out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        let cd_size = out.len() as u32 - cd_offset;
        out.extend_from_slice(&EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn reads_stored_entries() {
        let zip = build_zip(&[
            ("archive/data.pkl", b"pickle-bytes", METHOD_STORED),
            ("archive/data/0", &[1, 2, 3, 4], METHOD_STORED),
        ]);
        let archive = Archive::from_bytes(zip).unwrap();
        assert_eq!(archive.entry_names().count(), 2);
        assert_eq!(archive.read_by_name("archive/data.pkl").unwrap(), b"pickle-bytes");
        assert_eq!(archive.read_by_name("archive/data/0").unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn suffix_lookup() {
        let zip = build_zip(&[("model/data.pkl", b"x", METHOD_STORED)]);
        let archive = Archive::from_bytes(zip).unwrap();
        let entry = archive.find_suffix("data.pkl").unwrap();
        assert_eq!(entry.name, "model/data.pkl");
    }

    #[test]
    fn rejects_compressed_entries() {
        let zip = build_zip(&[("archive/data.pkl", b"deflated", 8)]);
        let archive = Archive::from_bytes(zip).unwrap();
        let err = archive.read_by_name("archive/data.pkl").unwrap_err();
        assert!(err.to_string().contains("compression method"));
    }

    #[test]
    fn missing_eocd_is_invalid() {
        assert!(Archive::from_bytes(b"PK\x03\x04 not a real archive".to_vec()).is_err());
        assert!(Archive::from_bytes(Vec::new()).is_err());
    }

    #[test]
    fn missing_entry_reported_by_name() {
        let zip = build_zip(&[("archive/data.pkl", b"x", METHOD_STORED)]);
        let archive = Archive::from_bytes(zip).unwrap();
        let err = archive.read_by_name("archive/data/7").unwrap_err();
        assert!(err.to_string().contains("archive/data/7"));
    }
}
