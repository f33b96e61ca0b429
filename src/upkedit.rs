use std::io::{Result, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::logservice::log_warn;
use crate::upkobjects::BulkDataMirror;
use crate::upkreader::{ExportEntry, ImportEntry, NameEntry, UpkPackage};

const SENDER: &str = "UpkEdit";

/// Trailer magic written after a moved payload; marks the 24-byte undo
/// record carrying the previous (size, offset) pair.
pub const PATCH_TAG: [u8; 16] = [
    0x7A, 0xA0, 0x56, 0xC9, 0x60, 0x5F, 0x7B, 0x31, 0x72, 0x5D, 0x4B, 0xC4, 0x7C, 0xD2, 0x4D, 0xD9,
];

const SERIAL_SIZE_FIELD_OFFSET: u64 = 32;
const SERIAL_OFFSET_FIELD_OFFSET: u64 = 36;

impl UpkPackage {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.stream.set_position(offset);
        self.stream.write_all(bytes)
    }

    /// Overwrites an export payload with a same-sized buffer, optionally
    /// capturing the previous bytes.
    pub fn write_export_data(
        &mut self,
        idx: u32,
        data: &[u8],
        backup: Option<&mut Vec<u8>>,
    ) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in write_export_data!", SENDER);
            return false;
        }
        if !self.is_loaded() {
            log_warn("Package is not loaded in write_export_data!", SENDER);
            return false;
        }
        let entry_offset = self.export_table[idx as usize].serial_offset as u64;
        let entry_size = self.export_table[idx as usize].serial_size as usize;
        if entry_size != data.len() {
            log_warn("Export object size != data chunk size in write_export_data!", SENDER);
            return false;
        }
        if let Some(backup) = backup {
            backup.clear();
            backup.extend_from_slice(
                &self.stream.get_ref()[entry_offset as usize..entry_offset as usize + entry_size],
            );
        }
        if self.write_at(entry_offset, data).is_err() {
            return false;
        }
        self.objects.clear();
        true
    }

    /// Rewrites the ASCII bytes of a name entry; the new name must have the
    /// same length.
    pub fn write_name_table_name(&mut self, idx: u32, name: &str) -> bool {
        if idx < 1 || idx as usize >= self.name_table.len() {
            log_warn("Index is out of bounds in write_name_table_name!", SENDER);
            return false;
        }
        if !self.is_loaded() {
            log_warn("Package is not loaded in write_name_table_name!", SENDER);
            return false;
        }
        let entry = &self.name_table[idx as usize];
        if (entry.name_length - 1) as usize != name.len() {
            log_warn("Name length != new name length in write_name_table_name!", SENDER);
            return false;
        }
        let offset = entry.entry_offset + 4;
        if self.write_at(offset, name.as_bytes()).is_err() {
            return false;
        }
        self.reinitialize_header().is_ok()
    }

    /// The leading 8-byte signature/version region is never writable.
    pub fn check_valid_file_offset(&self, offset: u64) -> bool {
        if !self.is_loaded() {
            return false;
        }
        offset >= 8 && offset < self.file_size as u64
    }

    pub fn write_data(&mut self, offset: u64, data: &[u8], backup: Option<&mut Vec<u8>>) -> bool {
        if !self.check_valid_file_offset(offset) {
            log_warn("File offset is out of bounds in write_data!", SENDER);
            return false;
        }
        if let Some(backup) = backup {
            backup.clear();
            let end = (offset as usize + data.len()).min(self.stream.get_ref().len());
            backup.extend_from_slice(&self.stream.get_ref()[offset as usize..end]);
        }
        if self.write_at(offset, data).is_err() {
            return false;
        }
        self.reinitialize_header().is_ok()
    }

    /// Serializes a bulk-data block for writing at `offset`.
    pub fn get_bulk_data(&self, offset: u64, data: Vec<u8>) -> Vec<u8> {
        let mut mirror = BulkDataMirror::from_data(data);
        mirror.set_file_offset(offset as u32 + BulkDataMirror::rel_offset());
        mirror.serialize()
    }

    /// Linear byte search over `[begin, limit]` (`limit` zero meaning end of
    /// file); returns the absolute offset or zero.
    pub fn find_data_chunk(&self, needle: &[u8], begin: usize, limit: usize) -> usize {
        if limit != 0 && (limit < begin || limit - begin + 1 < needle.len()) {
            log_warn("Invalid input params in find_data_chunk!", SENDER);
            return 0;
        }
        let end = if limit == 0 { self.file_size } else { (limit + 1).min(self.file_size) };
        let haystack = &self.stream.get_ref()[begin.min(self.file_size)..end];
        if needle.is_empty() {
            return 0;
        }
        haystack.windows(needle.len()).position(|w| w == needle).map_or(0, |pos| pos + begin)
    }

    /// The payload resized to `new_size`: inserted or removed bytes at
    /// `resize_at` when it falls inside the object, appended zeros otherwise.
    fn get_resized_data_chunk(&self, idx: u32, new_size: i32, resize_at: i32) -> Vec<u8> {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in get_resized_data_chunk!", SENDER);
            return Vec::new();
        }
        let mut data = self.get_export_data(idx);
        if new_size > 0 && new_size as usize != data.len() {
            if resize_at > 0 && resize_at < new_size {
                let resize_at = resize_at as usize;
                let diff = new_size as i64 - data.len() as i64;
                let mut new_data = vec![0u8; new_size as usize];
                new_data[..resize_at].copy_from_slice(&data[..resize_at]);
                if diff > 0 {
                    new_data[resize_at + diff as usize..]
                        .copy_from_slice(&data[resize_at..]);
                } else {
                    let skip = resize_at + (-diff) as usize;
                    new_data[resize_at..].copy_from_slice(&data[skip..]);
                }
                data = new_data;
            } else {
                data.resize(new_size as usize, 0);
            }
        }
        data
    }

    /// Appends the (possibly grown) payload at end of file and writes the
    /// undo trailer. A growing function payload is expanded between its
    /// header and bytecode tail, patching the script sizes and filling with
    /// the no-op opcode.
    pub fn move_export_data(&mut self, idx: u32, new_size: u32) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in move_export_data!", SENDER);
            return false;
        }
        let mut data = self.get_export_data(idx);
        let new_offset = self.stream.get_ref().len() as u32;
        let entry_offset = self.export_table[idx as usize].entry_offset;
        let old_size = self.export_table[idx as usize].serial_size;
        let old_offset = self.export_table[idx as usize].serial_offset;
        let is_function = self.export_table[idx as usize].type_name == "Function";
        let write: Result<()> = (|| {
            if new_size > old_size {
                self.stream.set_position(entry_offset + SERIAL_SIZE_FIELD_OFFSET);
                self.stream.write_all(&new_size.to_le_bytes())?;
                let diff = new_size as usize - data.len();
                if !is_function {
                    log_warn("Object is not a function in move_export_data!", SENDER);
                    data.resize(new_size as usize, 0);
                } else {
                    let old_mem_size =
                        u32::from_le_bytes([data[0x28], data[0x29], data[0x2A], data[0x2B]]);
                    let old_file_size =
                        u32::from_le_bytes([data[0x2C], data[0x2D], data[0x2E], data[0x2F]]);
                    let new_mem_size = old_mem_size + diff as u32;
                    let new_file_size = old_file_size + diff as u32;
                    let head_size = 0x30 + old_file_size as usize - 1;
                    let mut new_data = vec![0x0Bu8; new_size as usize];
                    new_data[..head_size].copy_from_slice(&data[..head_size]);
                    new_data[0x28..0x2C].copy_from_slice(&new_mem_size.to_le_bytes());
                    new_data[0x2C..0x30].copy_from_slice(&new_file_size.to_le_bytes());
                    new_data[head_size + diff..].copy_from_slice(&data[head_size..]);
                    data = new_data;
                }
            }
            self.stream.set_position(entry_offset + SERIAL_OFFSET_FIELD_OFFSET);
            self.stream.write_all(&new_offset.to_le_bytes())?;
            self.stream.set_position(new_offset as u64);
            self.stream.write_all(&data)?;
            self.stream.write_all(&PATCH_TAG)?;
            self.stream.write_all(&old_size.to_le_bytes())?;
            self.stream.write_all(&old_offset.to_le_bytes())?;
            Ok(())
        })();
        if write.is_err() {
            return false;
        }
        self.reinitialize_header().is_ok()
    }

    pub fn undo_move_export_data(&mut self, idx: u32) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in undo_move_export_data!", SENDER);
            return false;
        }
        let entry_offset = self.export_table[idx as usize].entry_offset;
        let trailer_offset = self.export_table[idx as usize].serial_offset as u64
            + self.export_table[idx as usize].serial_size as u64;
        let restore: Result<bool> = (|| {
            self.stream.set_position(trailer_offset);
            let mut tag = [0u8; 16];
            std::io::Read::read_exact(&mut self.stream, &mut tag)?;
            if tag != PATCH_TAG {
                return Ok(false);
            }
            let old_size = self.stream.read_u32::<LittleEndian>()?;
            let old_offset = self.stream.read_u32::<LittleEndian>()?;
            self.stream.set_position(entry_offset + SERIAL_SIZE_FIELD_OFFSET);
            self.stream.write_all(&old_size.to_le_bytes())?;
            self.stream.write_all(&old_offset.to_le_bytes())?;
            Ok(true)
        })();
        match restore {
            Ok(true) => self.reinitialize_header().is_ok(),
            _ => {
                log_warn("Undo trailer is missing in undo_move_export_data!", SENDER);
                false
            }
        }
    }

    pub fn move_resize_object(&mut self, idx: u32, new_size: i32, resize_at: i32) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in move_resize_object!", SENDER);
            return false;
        }
        let data = self.get_resized_data_chunk(idx, new_size, resize_at);
        let new_offset = self.stream.get_ref().len() as u32;
        let entry_offset = self.export_table[idx as usize].entry_offset;
        let old_size = self.export_table[idx as usize].serial_size;
        let old_offset = self.export_table[idx as usize].serial_offset;
        let write: Result<()> = (|| {
            if old_size as usize != data.len() {
                self.stream.set_position(entry_offset + SERIAL_SIZE_FIELD_OFFSET);
                self.stream.write_all(&new_size.to_le_bytes())?;
            }
            self.stream.set_position(entry_offset + SERIAL_OFFSET_FIELD_OFFSET);
            self.stream.write_all(&new_offset.to_le_bytes())?;
            self.stream.set_position(new_offset as u64);
            self.stream.write_all(&data)?;
            self.stream.write_all(&PATCH_TAG)?;
            self.stream.write_all(&old_size.to_le_bytes())?;
            self.stream.write_all(&old_offset.to_le_bytes())?;
            Ok(())
        })();
        if write.is_err() {
            return false;
        }
        self.reinitialize_header().is_ok()
    }

    pub fn undo_move_resize_object(&mut self, idx: u32) -> bool {
        self.undo_move_export_data(idx)
    }

    /// Changes an export's serial size in place: later payloads slide by the
    /// delta and the whole stream is rewritten around the resized object.
    pub fn resize_in_place(&mut self, idx: u32, new_size: i32, resize_at: i32) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in resize_in_place!", SENDER);
            return false;
        }
        let data = self.get_resized_data_chunk(idx, new_size, resize_at);
        let target_offset = self.export_table[idx as usize].serial_offset;
        let target_size = self.export_table[idx as usize].serial_size;
        let diff = data.len() as i64 - target_size as i64;
        for (i, entry) in self.export_table.iter_mut().enumerate().skip(1) {
            if i != idx as usize && entry.serial_offset > target_offset {
                entry.serial_offset = (entry.serial_offset as i64 + diff) as u32;
            }
        }
        let bytes = self.stream.get_ref();
        let before =
            bytes[self.summary.serial_offset as usize..target_offset as usize].to_vec();
        let after = bytes[(target_offset + target_size) as usize..].to_vec();
        self.export_table[idx as usize].serial_size = new_size as u32;
        let header = self.serialize_header();
        let mut stream = header;
        stream.extend_from_slice(&before);
        stream.extend_from_slice(&data);
        stream.extend_from_slice(&after);
        self.stream = std::io::Cursor::new(stream);
        self.reinitialize_header().is_ok()
    }

    /// Grows the name table by one entry, cascading the header size and
    /// every table and payload offset behind it.
    pub fn add_name_entry(&mut self, mut entry: NameEntry) -> bool {
        if !self.is_loaded() {
            log_warn("Package is not loaded in add_name_entry!", SENDER);
            return false;
        }
        entry.entry_size = if entry.name_length >= 0 {
            4 + entry.name_length as u32 + 8
        } else {
            4 + 2 * entry.name_length.unsigned_abs() + 8
        };
        let entry_size = entry.entry_size;
        let old_serial_offset = self.summary.serial_offset as usize;
        self.summary.header_size += entry_size;
        self.summary.name_count += 1;
        self.name_table.push(entry);
        self.summary.import_offset += entry_size;
        self.summary.export_offset += entry_size;
        self.summary.depends_offset += entry_size;
        self.summary.serial_offset += entry_size;
        for export in self.export_table.iter_mut().skip(1) {
            export.serial_offset += entry_size;
        }
        self.rewrite_with_serial_tail(old_serial_offset, &[])
    }

    pub fn add_import_entry(&mut self, mut entry: ImportEntry) -> bool {
        if !self.is_loaded() {
            log_warn("Package is not loaded in add_import_entry!", SENDER);
            return false;
        }
        entry.entry_size = 28;
        let entry_size = entry.entry_size;
        let old_serial_offset = self.summary.serial_offset as usize;
        self.summary.header_size += entry_size;
        self.summary.import_count += 1;
        self.import_table.push(entry);
        self.summary.export_offset += entry_size;
        self.summary.depends_offset += entry_size;
        self.summary.serial_offset += entry_size;
        for export in self.export_table.iter_mut().skip(1) {
            export.serial_offset += entry_size;
        }
        self.rewrite_with_serial_tail(old_serial_offset, &[])
    }

    /// Adds an export entry whose payload lands at end of file, seeded with
    /// the previous-object reference and the `"None"` name index, then links
    /// it as the last child of its owner.
    pub fn add_export_entry(&mut self, mut entry: ExportEntry) -> bool {
        if !self.is_loaded() {
            log_warn("Package is not loaded in add_export_entry!", SENDER);
            return false;
        }
        entry.entry_size = 68 + 4 * entry.net_objects.len() as u32;
        entry.net_object_count = entry.net_objects.len() as u32;
        let entry_size = entry.entry_size;
        let old_export_count = self.summary.export_count;
        let old_serial_offset = self.summary.serial_offset as usize;
        self.summary.header_size += entry_size;
        self.summary.export_count += 1;
        // PrevObject ref + "None" name ref + NextRef.
        if entry.serial_size < 16 {
            entry.serial_size = 16;
        }
        entry.serial_offset = self.file_size as u32 + entry_size;
        let owner_ref = entry.owner_ref;
        let serial_size = entry.serial_size;
        self.export_table.push(entry);
        self.summary.depends_offset += entry_size;
        self.summary.serial_offset += entry_size;
        for export in self.export_table.iter_mut().skip(1).take(old_export_count as usize) {
            export.serial_offset += entry_size;
        }
        let mut payload = vec![0u8; serial_size as usize];
        payload[..4].copy_from_slice(&(old_export_count as i32).to_le_bytes());
        payload[4..8].copy_from_slice(&self.none_idx.to_le_bytes());
        if !self.rewrite_with_serial_tail(old_serial_offset, &payload) {
            return false;
        }
        self.link_child(owner_ref, self.summary.export_count as i32);
        true
    }

    fn rewrite_with_serial_tail(&mut self, old_serial_offset: usize, appended: &[u8]) -> bool {
        let tail = self.stream.get_ref()[old_serial_offset..].to_vec();
        let mut stream = self.serialize_header();
        stream.extend_from_slice(&tail);
        stream.extend_from_slice(appended);
        self.stream = std::io::Cursor::new(stream);
        self.reinitialize_header().is_ok()
    }

    /// Links `child_ref` into its owner's child chain: directly when the
    /// owner has none, otherwise after the last sibling.
    pub fn link_child(&mut self, owner_ref: i32, child_ref: i32) -> bool {
        if owner_ref < 1 || owner_ref as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in link_child!", SENDER);
            return false;
        }
        let (first_child_ref, first_child_ref_offset, is_structure) = {
            let object = self.get_export_object(owner_ref as u32, false, true);
            (object.first_child_ref(), object.first_child_ref_offset(), object.is_structure())
        };
        if !is_structure {
            log_warn("Object is not a structure in link_child!", SENDER);
            return false;
        }
        if first_child_ref == 0 {
            let offset =
                first_child_ref_offset + self.export_table[owner_ref as usize].serial_offset as u64;
            let ok = self.write_at(offset, &child_ref.to_le_bytes()).is_ok();
            self.objects.clear();
            return ok;
        }
        let mut next_ref = first_child_ref;
        let mut last_ref_offset = 0u64;
        while next_ref != 0 {
            if next_ref < 0 || next_ref as usize >= self.export_table.len() {
                break;
            }
            let serial_offset = self.export_table[next_ref as usize].serial_offset as u64;
            let (next, next_offset) = {
                let object = self.get_export_object(next_ref as u32, false, true);
                (object.next_ref(), object.next_ref_offset())
            };
            // A field's next-ref always sits behind the object prefix; zero
            // means this sibling has no parseable next-ref field to patch.
            if next_offset == 0 {
                log_warn("Sibling has no next-ref field in link_child!", SENDER);
                break;
            }
            last_ref_offset = next_offset + serial_offset;
            next_ref = next;
        }
        let mut ok = true;
        if last_ref_offset != 0 {
            ok = self.write_at(last_ref_offset, &child_ref.to_le_bytes()).is_ok();
        }
        self.objects.clear();
        ok
    }
}
