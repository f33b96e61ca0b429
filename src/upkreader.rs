use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Result, Write};
use std::path::Path;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logservice::{log_debug, log_error, log_warn};
use crate::upkdecompress::{
    CompressedChunk, CompressedChunkBlock, CompressedChunkHeader, CompressionMethod,
    DecompressError, decompress_chunked, decompress_fully_compressed, read_compressed_chunks,
};
use crate::upkobjects::{UpkObject, deserialize_export};
use crate::upkregistry::{PackageHandle, find_package, register_package, unregister_package};

const SENDER: &str = "UpkReader";

pub const PACKAGE_TAG: u32 = 0x9E2A83C1;
pub const PACKAGE_VERSION: u16 = 845;

const MIN_NAME_ENTRY_SIZE: u32 = 12;
const IMPORT_ENTRY_SIZE: u32 = 28;
const MIN_EXPORT_ENTRY_SIZE: u32 = 68;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpkError {
    #[error("Bad package file!")]
    FileError,
    #[error("Bad package signature!")]
    BadSignature,
    #[error("Bad package version!")]
    BadVersion,
    #[error("Package is compressed, need to decompress first!")]
    IsCompressed,
    #[error("Error decompressing the package!")]
    DecompressionError,
    #[error("Package is not initialized, need to read package file first!")]
    Uninitialized,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PackageFlags: u32 {
        const AllowDownload = 0x1;
        const ClientOptional = 0x2;
        const ServerSideOnly = 0x4;
        const Cooked = 0x8;
        const Unsecure = 0x10;
        const SavedWithNewerVersion = 0x20;
        const Need = 0x8000;
        const ContainsMap = 0x20000;
        const Trash = 0x40000;
        const DisallowLazyLoading = 0x100000;
        const ContainsScript = 0x200000;
        const ContainsDebugInfo = 0x400000;
        const RequireImportsAlreadyLoaded = 0x800000;
        const StoreCompressed = 0x2000000;
        const StoreFullyCompressed = 0x4000000;
        const ContainsFaceFxData = 0x10000000;
        const NoExportAllowed = 0x20000000;
        const StrippedSource = 0x40000000;
        const FilterEditorOnly = 0x80000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlagsL: u32 {
        const Transactional = 0x00000001;
        const Unreachable = 0x00000002;
        const Public = 0x00000004;
        const TagImp = 0x00000008;
        const TagExp = 0x00000010;
        const Obsolete = 0x00000020;
        const Transient = 0x00004000;
        const LoadForClient = 0x00010000;
        const LoadForServer = 0x00020000;
        const LoadForEdit = 0x00040000;
        const Standalone = 0x00080000;
        const NotForClient = 0x00100000;
        const NotForServer = 0x00200000;
        const NotForEdit = 0x00400000;
        const HasStack = 0x02000000;
        const Native = 0x04000000;
        const Marked = 0x08000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlagsH: u32 {
        const Final = 0x00000080;
        const PerObjectLocalized = 0x00000100;
        const PropertiesObject = 0x00000200;
        const ArchetypeObject = 0x00000400;
        const RemappedName = 0x00000800;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExportFlags: u32 {
        const ForcedExport = 0x1;
        const ScriptPatcherExport = 0x2;
        const MemberFieldPatchPending = 0x4;
    }
}

/// Renders set flags one per line, indented for the verbose table dumps.
pub(crate) fn flag_lines<F: bitflags::Flags>(flags: &F) -> String {
    let mut out = String::new();
    for (name, _) in flags.iter_names() {
        out.push_str("\t\t");
        out.push_str(name);
        out.push('\n');
    }
    out
}

/// An 8-byte reference into the name table: index plus 1-based numeric
/// suffix, zero meaning no suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameIndex {
    pub index: u32,
    pub numeric: u32,
}

pub fn read_name_index<R: Read>(reader: &mut R) -> Result<NameIndex> {
    Ok(NameIndex {
        index: reader.read_u32::<LittleEndian>()?,
        numeric: reader.read_u32::<LittleEndian>()?,
    })
}

pub fn write_name_index<W: Write>(writer: &mut W, idx: NameIndex) -> Result<()> {
    writer.write_u32::<LittleEndian>(idx.index)?;
    writer.write_u32::<LittleEndian>(idx.numeric)?;
    Ok(())
}

pub fn read_guid<R: Read>(reader: &mut R) -> Result<[u32; 4]> {
    Ok([
        reader.read_u32::<LittleEndian>()?,
        reader.read_u32::<LittleEndian>()?,
        reader.read_u32::<LittleEndian>()?,
        reader.read_u32::<LittleEndian>()?,
    ])
}

/// Reads bytes up to and including a null terminator, returning the string
/// without it.
pub fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(bytes.iter().map(|&b| b as char).collect())
}

pub fn format_hex(value: u32) -> String {
    format!("0x{value:08X}")
}

pub fn format_hex16(value: u16) -> String {
    format!("0x{value:04X}")
}

pub fn format_hex8(value: u8) -> String {
    format!("0x{value:02X}")
}

pub fn format_hex_float(value: f32) -> String {
    format!("0x{:08X}", value.to_bits())
}

pub fn format_hex_guid(guid: [u32; 4]) -> String {
    format!("{:08X}{:08X}{:08X}{:08X}", guid[0], guid[1], guid[2], guid[3])
}

pub fn format_hex_name(idx: NameIndex) -> String {
    format!("0x{:08X} (Index) 0x{:08X} (Numeric)", idx.index, idx.numeric)
}

pub fn format_hex_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for b in data {
        out.push_str(&format!("{b:02X} "));
    }
    out
}

pub(crate) fn filename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

pub(crate) fn filename_no_ext(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub export_count: i32,
    pub name_count: i32,
    pub net_object_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpkSummary {
    pub signature: u32,
    pub version: u16,
    pub licensee_version: u16,
    pub header_size: u32,
    pub folder_name_length: i32,
    pub folder_name: String,
    pub package_flags: u32,
    pub name_count: u32,
    pub name_offset: u32,
    pub export_count: u32,
    pub export_offset: u32,
    pub import_count: u32,
    pub import_offset: u32,
    pub depends_offset: u32,
    pub serial_offset: u32,
    pub unknown2: u32,
    pub unknown3: u32,
    pub unknown4: u32,
    pub guid: [u32; 4],
    pub generations_count: u32,
    pub generations: Vec<GenerationInfo>,
    pub engine_version: u32,
    pub cooker_version: u32,
    pub compression_flags: u32,
    pub num_compressed_chunks: u32,
    pub compressed_chunks: Vec<CompressedChunk>,
    /// Whatever sits between the declared fields and the first table (or the
    /// first compressed chunk); preserved verbatim for round-trips.
    pub unknown_data_chunk: Vec<u8>,
}

impl UpkSummary {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out).unwrap_or_else(|_| unreachable!("in-memory write"));
        out
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.signature)?;
        let packed = ((self.licensee_version as u32) << 16) | self.version as u32;
        w.write_u32::<LittleEndian>(packed)?;
        w.write_u32::<LittleEndian>(self.header_size)?;
        w.write_i32::<LittleEndian>(self.folder_name_length)?;
        if self.folder_name_length > 0 {
            w.write_all(self.folder_name.as_bytes())?;
            w.write_u8(0)?;
        }
        w.write_u32::<LittleEndian>(self.package_flags)?;
        w.write_u32::<LittleEndian>(self.name_count)?;
        w.write_u32::<LittleEndian>(self.name_offset)?;
        w.write_u32::<LittleEndian>(self.export_count)?;
        w.write_u32::<LittleEndian>(self.export_offset)?;
        w.write_u32::<LittleEndian>(self.import_count)?;
        w.write_u32::<LittleEndian>(self.import_offset)?;
        w.write_u32::<LittleEndian>(self.depends_offset)?;
        w.write_u32::<LittleEndian>(self.serial_offset)?;
        w.write_u32::<LittleEndian>(self.unknown2)?;
        w.write_u32::<LittleEndian>(self.unknown3)?;
        w.write_u32::<LittleEndian>(self.unknown4)?;
        for v in self.guid {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.generations_count)?;
        for generation in self.generations.iter().take(self.generations_count as usize) {
            w.write_i32::<LittleEndian>(generation.export_count)?;
            w.write_i32::<LittleEndian>(generation.name_count)?;
            w.write_i32::<LittleEndian>(generation.net_object_count)?;
        }
        w.write_u32::<LittleEndian>(self.engine_version)?;
        w.write_u32::<LittleEndian>(self.cooker_version)?;
        w.write_u32::<LittleEndian>(self.compression_flags)?;
        w.write_u32::<LittleEndian>(self.num_compressed_chunks)?;
        for chunk in self.compressed_chunks.iter().take(self.num_compressed_chunks as usize) {
            w.write_u32::<LittleEndian>(chunk.uncompressed_offset)?;
            w.write_u32::<LittleEndian>(chunk.uncompressed_size)?;
            w.write_u32::<LittleEndian>(chunk.compressed_offset)?;
            w.write_u32::<LittleEndian>(chunk.compressed_size)?;
        }
        if !self.unknown_data_chunk.is_empty() {
            w.write_all(&self.unknown_data_chunk)?;
        }
        Ok(())
    }
}

impl fmt::Display for UpkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Signature: {}", format_hex(self.signature))?;
        writeln!(f, "Version: {}", self.version)?;
        writeln!(f, "LicenseeVersion: {}", self.licensee_version)?;
        writeln!(f, "HeaderSize: {} ({})", self.header_size, format_hex(self.header_size))?;
        writeln!(f, "Folder: {}", self.folder_name)?;
        writeln!(f, "PackageFlags: {}", format_hex(self.package_flags))?;
        write!(f, "{}", flag_lines(&PackageFlags::from_bits_truncate(self.package_flags)))?;
        writeln!(f, "NameCount: {}", self.name_count)?;
        writeln!(f, "NameOffset: {}", format_hex(self.name_offset))?;
        writeln!(f, "ExportCount: {}", self.export_count)?;
        writeln!(f, "ExportOffset: {}", format_hex(self.export_offset))?;
        writeln!(f, "ImportCount: {}", self.import_count)?;
        writeln!(f, "ImportOffset: {}", format_hex(self.import_offset))?;
        writeln!(f, "DependsOffset: {}", format_hex(self.depends_offset))?;
        writeln!(f, "SerialOffset: {}", format_hex(self.serial_offset))?;
        writeln!(f, "Unknown2: {}", format_hex(self.unknown2))?;
        writeln!(f, "Unknown3: {}", format_hex(self.unknown3))?;
        writeln!(f, "Unknown4: {}", format_hex(self.unknown4))?;
        writeln!(f, "GUID: {}", format_hex_guid(self.guid))?;
        writeln!(f, "GenerationsCount: {}", self.generations_count)?;
        for (i, generation) in self.generations.iter().enumerate() {
            writeln!(f, "Generations[{i}]:")?;
            writeln!(f, "\tExportCount: {}", generation.export_count)?;
            writeln!(f, "\tNameCount: {}", generation.name_count)?;
            writeln!(f, "\tNetObjectCount: {}", generation.net_object_count)?;
        }
        writeln!(f, "EngineVersion: {}", self.engine_version)?;
        writeln!(f, "CookerVersion: {}", self.cooker_version)?;
        writeln!(f, "CompressionFlags: {}", format_hex(self.compression_flags))?;
        writeln!(f, "NumCompressedChunks: {}", self.num_compressed_chunks)?;
        for (i, chunk) in self.compressed_chunks.iter().enumerate() {
            writeln!(f, "CompressedChunks[{i}]:")?;
            writeln!(
                f,
                "\tUncompressedOffset: {} ({})",
                format_hex(chunk.uncompressed_offset),
                chunk.uncompressed_offset
            )?;
            writeln!(f, "\tUncompressedSize: {}", chunk.uncompressed_size)?;
            writeln!(
                f,
                "\tCompressedOffset: {} ({})",
                format_hex(chunk.compressed_offset),
                chunk.compressed_offset
            )?;
            writeln!(f, "\tCompressedSize: {}", chunk.compressed_size)?;
        }
        if !self.unknown_data_chunk.is_empty() {
            writeln!(f, "Unknown data size: {}", self.unknown_data_chunk.len())?;
            writeln!(f, "Unknown data: {}", format_hex_bytes(&self.unknown_data_chunk))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameEntry {
    pub name_length: i32,
    pub name: String,
    pub flags_l: u32,
    pub flags_h: u32,
    pub entry_offset: u64,
    pub entry_size: u32,
}

impl Default for NameEntry {
    fn default() -> NameEntry {
        NameEntry {
            name_length: 5,
            name: "None".into(),
            flags_l: 0,
            flags_h: 0,
            entry_offset: 0,
            entry_size: 0,
        }
    }
}

impl NameEntry {
    pub fn new(name: &str, flags_l: u32, flags_h: u32) -> NameEntry {
        NameEntry {
            name_length: name.len() as i32 + 1,
            name: name.to_string(),
            flags_l,
            flags_h,
            entry_offset: 0,
            entry_size: MIN_NAME_ENTRY_SIZE + name.len() as u32 + 1,
        }
    }

    /// Parses a raw serialized entry, validating the declared length against
    /// the buffer size.
    pub fn from_bytes(data: &[u8]) -> Option<NameEntry> {
        if data.len() < MIN_NAME_ENTRY_SIZE as usize {
            log_warn("Bad data in NameEntry::from_bytes!", SENDER);
            return None;
        }
        let mut cursor = Cursor::new(data);
        let mut entry = read_name_entry(&mut cursor).ok()?;
        if entry.entry_size as usize != data.len() {
            log_warn("Bad data in NameEntry::from_bytes!", SENDER);
            return None;
        }
        entry.entry_offset = 0;
        Some(entry)
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(self.name_length)?;
        if self.name_length > 0 {
            w.write_all(self.name.as_bytes())?;
            w.write_u8(0)?;
        } else if self.name_length < 0 {
            for unit in self.name.encode_utf16() {
                w.write_u16::<LittleEndian>(unit)?;
            }
            w.write_u16::<LittleEndian>(0)?;
        }
        w.write_u32::<LittleEndian>(self.flags_l)?;
        w.write_u32::<LittleEndian>(self.flags_h)?;
        Ok(())
    }
}

fn read_name_entry(cursor: &mut Cursor<impl AsRef<[u8]>>) -> Result<NameEntry> {
    let entry_offset = cursor.position();
    let name_length = cursor.read_i32::<LittleEndian>()?;
    let name = if name_length > 0 {
        let mut bytes = vec![0u8; name_length as usize];
        cursor.read_exact(&mut bytes)?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes.iter().map(|&b| b as char).collect()
    } else if name_length < 0 {
        let mut units = vec![0u16; (-name_length) as usize];
        for unit in units.iter_mut() {
            *unit = cursor.read_u16::<LittleEndian>()?;
        }
        if units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16_lossy(&units)
    } else {
        String::new()
    };
    let flags_l = cursor.read_u32::<LittleEndian>()?;
    let flags_h = cursor.read_u32::<LittleEndian>()?;
    Ok(NameEntry {
        name_length,
        name,
        flags_l,
        flags_h,
        entry_offset,
        entry_size: (cursor.position() - entry_offset) as u32,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportEntry {
    pub package_idx: NameIndex,
    pub type_idx: NameIndex,
    pub owner_ref: i32,
    pub name_idx: NameIndex,
    pub entry_offset: u64,
    pub entry_size: u32,
    pub name: String,
    pub full_name: String,
    pub type_name: String,
}

impl ImportEntry {
    pub fn from_bytes(data: &[u8]) -> Option<ImportEntry> {
        if data.len() != IMPORT_ENTRY_SIZE as usize {
            log_warn("Bad data in ImportEntry::from_bytes!", SENDER);
            return None;
        }
        let mut cursor = Cursor::new(data);
        read_import_entry(&mut cursor).ok()
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_name_index(w, self.package_idx)?;
        write_name_index(w, self.type_idx)?;
        w.write_i32::<LittleEndian>(self.owner_ref)?;
        write_name_index(w, self.name_idx)?;
        Ok(())
    }
}

fn read_import_entry(cursor: &mut Cursor<impl AsRef<[u8]>>) -> Result<ImportEntry> {
    let entry_offset = cursor.position();
    let package_idx = read_name_index(cursor)?;
    let type_idx = read_name_index(cursor)?;
    let owner_ref = cursor.read_i32::<LittleEndian>()?;
    let name_idx = read_name_index(cursor)?;
    Ok(ImportEntry {
        package_idx,
        type_idx,
        owner_ref,
        name_idx,
        entry_offset,
        entry_size: (cursor.position() - entry_offset) as u32,
        ..Default::default()
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportEntry {
    pub type_ref: i32,
    pub parent_class_ref: i32,
    pub owner_ref: i32,
    pub name_idx: NameIndex,
    pub archetype_ref: i32,
    pub object_flags_h: u32,
    pub object_flags_l: u32,
    pub serial_size: u32,
    pub serial_offset: u32,
    pub export_flags: u32,
    pub net_object_count: u32,
    pub guid: [u32; 4],
    pub unknown1: u32,
    pub net_objects: Vec<u32>,
    pub entry_offset: u64,
    pub entry_size: u32,
    pub name: String,
    pub full_name: String,
    pub type_name: String,
}

impl ExportEntry {
    pub fn from_bytes(data: &[u8]) -> Option<ExportEntry> {
        if data.len() < MIN_EXPORT_ENTRY_SIZE as usize {
            log_warn("Bad data in ExportEntry::from_bytes!", SENDER);
            return None;
        }
        let mut cursor = Cursor::new(data);
        let entry = read_export_entry(&mut cursor).ok()?;
        if entry.entry_size as usize != data.len() {
            log_warn("Bad data in ExportEntry::from_bytes!", SENDER);
            return None;
        }
        Some(entry)
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(self.type_ref)?;
        w.write_i32::<LittleEndian>(self.parent_class_ref)?;
        w.write_i32::<LittleEndian>(self.owner_ref)?;
        write_name_index(w, self.name_idx)?;
        w.write_i32::<LittleEndian>(self.archetype_ref)?;
        w.write_u32::<LittleEndian>(self.object_flags_h)?;
        w.write_u32::<LittleEndian>(self.object_flags_l)?;
        w.write_u32::<LittleEndian>(self.serial_size)?;
        w.write_u32::<LittleEndian>(self.serial_offset)?;
        w.write_u32::<LittleEndian>(self.export_flags)?;
        w.write_u32::<LittleEndian>(self.net_object_count)?;
        for v in self.guid {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.unknown1)?;
        for net in self.net_objects.iter().take(self.net_object_count as usize) {
            w.write_u32::<LittleEndian>(*net)?;
        }
        Ok(())
    }
}

fn read_export_entry(cursor: &mut Cursor<impl AsRef<[u8]>>) -> Result<ExportEntry> {
    let entry_offset = cursor.position();
    let type_ref = cursor.read_i32::<LittleEndian>()?;
    let parent_class_ref = cursor.read_i32::<LittleEndian>()?;
    let owner_ref = cursor.read_i32::<LittleEndian>()?;
    let name_idx = read_name_index(cursor)?;
    let archetype_ref = cursor.read_i32::<LittleEndian>()?;
    let object_flags_h = cursor.read_u32::<LittleEndian>()?;
    let object_flags_l = cursor.read_u32::<LittleEndian>()?;
    let serial_size = cursor.read_u32::<LittleEndian>()?;
    let serial_offset = cursor.read_u32::<LittleEndian>()?;
    let export_flags = cursor.read_u32::<LittleEndian>()?;
    let net_object_count = cursor.read_u32::<LittleEndian>()?;
    let guid = read_guid(cursor)?;
    let unknown1 = cursor.read_u32::<LittleEndian>()?;
    let mut net_objects = Vec::new();
    for _ in 0..net_object_count {
        net_objects.push(cursor.read_u32::<LittleEndian>()?);
    }
    Ok(ExportEntry {
        type_ref,
        parent_class_ref,
        owner_ref,
        name_idx,
        archetype_ref,
        object_flags_h,
        object_flags_l,
        serial_size,
        serial_offset,
        export_flags,
        net_object_count,
        guid,
        unknown1,
        net_objects,
        entry_offset,
        entry_size: (cursor.position() - entry_offset) as u32,
        ..Default::default()
    })
}

enum HeaderOutcome {
    Parsed,
    BadSignature,
    EnvelopeCandidate,
    NeedsDecompression,
}

/// A loaded package: the decompressed byte stream, parsed summary and
/// tables, and a cache of deserialized export objects.
pub struct UpkPackage {
    pub(crate) upk_file_name: String,
    pub(crate) package_name: String,
    pub(crate) stream: Cursor<Vec<u8>>,
    pub(crate) file_size: usize,
    pub(crate) summary: UpkSummary,
    pub(crate) name_table: Vec<NameEntry>,
    pub(crate) import_table: Vec<ImportEntry>,
    pub(crate) export_table: Vec<ExportEntry>,
    pub(crate) depends_buf: Vec<u8>,
    pub(crate) none_idx: u32,
    pub(crate) read_error: Option<UpkError>,
    pub(crate) compressed: bool,
    pub(crate) fully_compressed: bool,
    pub(crate) compressed_header: CompressedChunkHeader,
    pub(crate) last_accessed_export: Cell<i32>,
    pub(crate) objects: HashMap<u32, UpkObject>,
    registered: bool,
}

impl Default for UpkPackage {
    fn default() -> UpkPackage {
        UpkPackage::new()
    }
}

impl Drop for UpkPackage {
    fn drop(&mut self) {
        if self.registered {
            unregister_package(&self.package_name);
            log_debug(&format!("Package {} unregistered.", self.package_name), SENDER);
        }
    }
}

impl UpkPackage {
    pub fn new() -> UpkPackage {
        UpkPackage {
            upk_file_name: String::new(),
            package_name: String::new(),
            stream: Cursor::new(Vec::new()),
            file_size: 0,
            summary: UpkSummary::default(),
            name_table: vec![NameEntry::default()],
            import_table: vec![ImportEntry::default()],
            export_table: vec![ExportEntry::default()],
            depends_buf: Vec::new(),
            none_idx: 0,
            read_error: Some(UpkError::Uninitialized),
            compressed: false,
            fully_compressed: false,
            compressed_header: CompressedChunkHeader::default(),
            last_accessed_export: Cell::new(0),
            objects: HashMap::new(),
            registered: false,
        }
    }

    pub fn load_file(filename: &str) -> std::result::Result<UpkPackage, UpkError> {
        let mut package = UpkPackage::new();
        package.load_package(Some(filename))?;
        Ok(package)
    }

    /// Loads a package image already in memory; the test and decompress
    /// paths share this with `load_package`.
    pub fn load_from_bytes(
        package_name: &str,
        bytes: Vec<u8>,
    ) -> std::result::Result<UpkPackage, UpkError> {
        let mut package = UpkPackage::new();
        package.package_name = package_name.to_string();
        package.upk_file_name = format!("{package_name}.upk");
        package.stream = Cursor::new(bytes);
        package.read_package_header()?;
        package.finish_registration();
        Ok(package)
    }

    pub fn load_package(&mut self, filename: Option<&str>) -> std::result::Result<(), UpkError> {
        if let Some(name) = filename {
            self.upk_file_name = name.to_string();
            log_debug(&format!("UPK File Name = {}", self.upk_file_name), SENDER);
            self.package_name = filename_no_ext(&self.upk_file_name);
        }
        let bytes = match fs::read(&self.upk_file_name) {
            Ok(bytes) => bytes,
            Err(_) => return Err(self.log_error_state(UpkError::FileError)),
        };
        self.stream = Cursor::new(bytes);
        log_debug("UPK file loaded into memory, reading package header...", SENDER);
        self.read_package_header()?;
        self.finish_registration();
        Ok(())
    }

    fn finish_registration(&mut self) {
        if find_package(&self.package_name).is_some() {
            log_debug(&format!("Duplicated package name: {}", self.package_name), SENDER);
            self.package_name.push_str("_duplicate");
        }
        register_package(PackageHandle {
            package_name: self.package_name.clone(),
            upk_name: filename(&self.upk_file_name),
        });
        self.registered = true;
        log_debug(&format!("Package registered as {}", self.package_name), SENDER);
    }

    pub fn save_package(&mut self, new_file_name: Option<&str>) -> std::result::Result<(), UpkError> {
        if let Some(name) = new_file_name {
            self.upk_file_name = name.to_string();
            log_debug(&format!("UPK File Name = {}", self.upk_file_name), SENDER);
        }
        if fs::write(&self.upk_file_name, self.stream.get_ref()).is_err() {
            return Err(self.log_error_state(UpkError::FileError));
        }
        log_debug(&format!("Package saved to {}", self.upk_file_name), SENDER);
        if self.registered {
            let current = find_package(&self.package_name);
            if current.map(|h| h.upk_name) != Some(filename(&self.upk_file_name)) {
                unregister_package(&self.package_name);
                register_package(PackageHandle {
                    package_name: self.package_name.clone(),
                    upk_name: filename(&self.upk_file_name),
                });
                log_debug(&format!("Package re-registered as {}", self.package_name), SENDER);
            }
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.read_error.is_none()
    }

    pub fn get_error(&self) -> Option<UpkError> {
        self.read_error
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_fully_compressed(&self) -> bool {
        self.compressed && self.fully_compressed
    }

    pub fn get_package_name(&self) -> &str {
        &self.package_name
    }

    pub fn get_upk_file_name(&self) -> &str {
        &self.upk_file_name
    }

    pub fn get_summary(&self) -> &UpkSummary {
        &self.summary
    }

    pub fn get_export_table(&self) -> &[ExportEntry] {
        &self.export_table
    }

    pub fn get_import_table(&self) -> &[ImportEntry] {
        &self.import_table
    }

    pub fn get_name_table(&self) -> &[NameEntry] {
        &self.name_table
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn bytes(&self) -> &[u8] {
        self.stream.get_ref()
    }

    pub fn last_accessed_export(&self) -> i32 {
        self.last_accessed_export.get()
    }

    fn log_error_state(&mut self, err: UpkError) -> UpkError {
        self.read_error = Some(err);
        log_error(&err.to_string(), SENDER);
        err
    }

    /// Maps a decompression failure onto the reader taxonomy: a layout
    /// sanity failure is a decompression error, a failed decode pass means
    /// the package stays compressed.
    fn decompress_error_state(&mut self, err: DecompressError) -> UpkError {
        log_error(&err.to_string(), SENDER);
        match err {
            DecompressError::BadStream(_) => self.log_error_state(UpkError::DecompressionError),
            DecompressError::DecoderFailed(_) => self.log_error_state(UpkError::IsCompressed),
        }
    }

    pub fn reinitialize_header(&mut self) -> std::result::Result<(), UpkError> {
        if !self.is_loaded() {
            return Err(self.log_error_state(UpkError::Uninitialized));
        }
        self.read_package_header()
    }

    pub fn read_package_header(&mut self) -> std::result::Result<(), UpkError> {
        if !self.objects.is_empty() {
            log_debug("Clearing objects cache.", SENDER);
            self.objects.clear();
        }
        self.compressed_header = CompressedChunkHeader::default();
        self.read_error = None;
        self.compressed = false;
        self.fully_compressed = false;
        self.last_accessed_export.set(0);
        let outcome = match self.parse_header() {
            Ok(outcome) => outcome,
            Err(_) => return Err(self.log_error_state(UpkError::FileError)),
        };
        match outcome {
            HeaderOutcome::Parsed => Ok(()),
            HeaderOutcome::BadSignature => Err(self.log_error_state(UpkError::BadSignature)),
            HeaderOutcome::EnvelopeCandidate => {
                log_debug("Bad version, checking if package is fully compressed...", SENDER);
                self.read_compressed_header()
            }
            HeaderOutcome::NeedsDecompression => self.decompress_declared_chunks(),
        }
    }

    fn parse_header(&mut self) -> Result<HeaderOutcome> {
        log_debug("Reading package Summary...", SENDER);
        self.stream.set_position(0);
        let file_len = self.stream.get_ref().len() as u64;
        self.summary = UpkSummary::default();
        self.summary.signature = self.stream.read_u32::<LittleEndian>()?;
        if self.summary.signature != PACKAGE_TAG {
            return Ok(HeaderOutcome::BadSignature);
        }
        let packed = self.stream.read_u32::<LittleEndian>()?;
        self.summary.version = (packed & 0xFFFF) as u16;
        self.summary.licensee_version = (packed >> 16) as u16;
        if self.summary.version != PACKAGE_VERSION {
            return Ok(HeaderOutcome::EnvelopeCandidate);
        }
        self.summary.header_size = self.stream.read_u32::<LittleEndian>()?;
        self.summary.folder_name_length = self.stream.read_i32::<LittleEndian>()?;
        if self.summary.folder_name_length > 0 {
            let mut bytes = vec![0u8; self.summary.folder_name_length as usize];
            self.stream.read_exact(&mut bytes)?;
            if bytes.last() == Some(&0) {
                bytes.pop();
            }
            self.summary.folder_name = bytes.iter().map(|&b| b as char).collect();
        }
        self.summary.package_flags = self.stream.read_u32::<LittleEndian>()?;
        self.summary.name_count = self.stream.read_u32::<LittleEndian>()?;
        self.summary.name_offset = self.stream.read_u32::<LittleEndian>()?;
        self.summary.export_count = self.stream.read_u32::<LittleEndian>()?;
        self.summary.export_offset = self.stream.read_u32::<LittleEndian>()?;
        self.summary.import_count = self.stream.read_u32::<LittleEndian>()?;
        self.summary.import_offset = self.stream.read_u32::<LittleEndian>()?;
        self.summary.depends_offset = self.stream.read_u32::<LittleEndian>()?;
        self.summary.serial_offset = self.stream.read_u32::<LittleEndian>()?;
        self.summary.unknown2 = self.stream.read_u32::<LittleEndian>()?;
        self.summary.unknown3 = self.stream.read_u32::<LittleEndian>()?;
        self.summary.unknown4 = self.stream.read_u32::<LittleEndian>()?;
        self.summary.guid = read_guid(&mut self.stream)?;
        self.summary.generations_count = self.stream.read_u32::<LittleEndian>()?;
        for _ in 0..self.summary.generations_count {
            self.summary.generations.push(GenerationInfo {
                export_count: self.stream.read_i32::<LittleEndian>()?,
                name_count: self.stream.read_i32::<LittleEndian>()?,
                net_object_count: self.stream.read_i32::<LittleEndian>()?,
            });
        }
        self.summary.engine_version = self.stream.read_u32::<LittleEndian>()?;
        self.summary.cooker_version = self.stream.read_u32::<LittleEndian>()?;
        self.summary.compression_flags = self.stream.read_u32::<LittleEndian>()?;
        self.summary.num_compressed_chunks = self.stream.read_u32::<LittleEndian>()?;
        self.compressed =
            self.summary.num_compressed_chunks > 0 || self.summary.compression_flags != 0;
        log_debug("Reading CompressedChunks...", SENDER);
        self.summary.compressed_chunks =
            read_compressed_chunks(&mut self.stream, self.summary.num_compressed_chunks as usize)?;
        log_debug("Reading UnknownDataChunk...", SENDER);
        let position = self.stream.position();
        let trailer_end = if self.summary.num_compressed_chunks < 1 {
            self.summary.name_offset as u64
        } else {
            self.summary.compressed_chunks[0].compressed_offset as u64
        };
        if trailer_end > position {
            let mut trailer = vec![0u8; (trailer_end - position) as usize];
            self.stream.read_exact(&mut trailer)?;
            self.summary.unknown_data_chunk = trailer;
        }
        if self.compressed {
            return Ok(HeaderOutcome::NeedsDecompression);
        }

        log_debug("Reading NameTable...", SENDER);
        self.name_table = Vec::new();
        self.none_idx = 0;
        self.stream.set_position(self.summary.name_offset as u64);
        if self.summary.name_offset as u64 + self.summary.name_count as u64 * MIN_NAME_ENTRY_SIZE as u64
            > file_len
        {
            log_warn("Declared name table overruns the file, clamping to zero!", SENDER);
            self.summary.name_count = 0;
        }
        for i in 0..self.summary.name_count {
            let entry = read_name_entry(&mut self.stream)?;
            if entry.name == "None" {
                self.none_idx = i;
            }
            self.name_table.push(entry);
        }
        if self.name_table.is_empty() {
            self.name_table.push(NameEntry::default());
        }

        log_debug("Reading ImportTable...", SENDER);
        self.import_table = vec![ImportEntry::default()];
        self.stream.set_position(self.summary.import_offset as u64);
        if self.summary.import_offset as u64 + self.summary.import_count as u64 * IMPORT_ENTRY_SIZE as u64
            > file_len
        {
            log_warn("Declared import table overruns the file, clamping to zero!", SENDER);
            self.summary.import_count = 0;
        }
        for _ in 0..self.summary.import_count {
            self.import_table.push(read_import_entry(&mut self.stream)?);
        }

        log_debug("Reading ExportTable...", SENDER);
        self.export_table = vec![ExportEntry::default()];
        self.stream.set_position(self.summary.export_offset as u64);
        if self.summary.export_offset as u64
            + self.summary.export_count as u64 * MIN_EXPORT_ENTRY_SIZE as u64
            > file_len
        {
            log_warn("Declared export table overruns the file, clamping to zero!", SENDER);
            self.summary.export_count = 0;
        }
        for _ in 0..self.summary.export_count {
            self.export_table.push(read_export_entry(&mut self.stream)?);
        }

        log_debug("Reading DependsBuf...", SENDER);
        let depends_size =
            (self.summary.serial_offset as u64).saturating_sub(self.summary.depends_offset as u64);
        self.depends_buf = vec![0u8; depends_size as usize];
        if !self.depends_buf.is_empty() {
            self.stream.read_exact(&mut self.depends_buf)?;
        }

        log_debug("Resolving ImportTable names...", SENDER);
        for i in 1..self.import_table.len() {
            let name = self.index_to_name(self.import_table[i].name_idx);
            let full_name = self.resolve_full_name(-(i as i32));
            let mut type_name = self.index_to_name(self.import_table[i].type_idx);
            if type_name.is_empty() {
                type_name = "Class".into();
            }
            let entry = &mut self.import_table[i];
            entry.name = name;
            entry.full_name = full_name;
            entry.type_name = type_name;
        }
        log_debug("Resolving ExportTable names...", SENDER);
        for i in 1..self.export_table.len() {
            let name = self.index_to_name(self.export_table[i].name_idx);
            let full_name = self.resolve_full_name(i as i32);
            let mut type_name = self.objref_to_name(self.export_table[i].type_ref);
            if type_name.is_empty() {
                type_name = "Class".into();
            }
            let entry = &mut self.export_table[i];
            entry.name = name;
            entry.full_name = full_name;
            entry.type_name = type_name;
        }
        log_debug("Package header read successfully.", SENDER);
        self.file_size = self.stream.get_ref().len();
        Ok(HeaderOutcome::Parsed)
    }

    pub fn read_compressed_header(&mut self) -> std::result::Result<(), UpkError> {
        log_debug("Reading compressed header...", SENDER);
        self.read_error = None;
        self.compressed = false;
        self.fully_compressed = false;
        self.last_accessed_export.set(0);
        let file_len = self.stream.get_ref().len() as u64;
        self.stream.set_position(0);
        let mut header = CompressedChunkHeader::default();
        let parsed: Result<()> = (|| {
            header.signature = self.stream.read_u32::<LittleEndian>()?;
            header.block_size = self.stream.read_u32::<LittleEndian>()?;
            header.compressed_size = self.stream.read_u32::<LittleEndian>()?;
            header.uncompressed_size = self.stream.read_u32::<LittleEndian>()?;
            Ok(())
        })();
        if parsed.is_err() {
            return Err(self.log_error_state(UpkError::FileError));
        }
        if header.signature != PACKAGE_TAG {
            return Err(self.log_error_state(UpkError::BadSignature));
        }
        if header.block_size == 0 {
            return Err(self.log_error_state(UpkError::BadVersion));
        }
        header.num_blocks = header.uncompressed_size.div_ceil(header.block_size);
        let head_size = 16 + header.num_blocks as u64 * 8;
        if head_size > file_len {
            return Err(self.log_error_state(UpkError::BadVersion));
        }
        let payload_size = file_len - head_size;
        if header.compressed_size as u64 != payload_size
            || (header.uncompressed_size as u64) < payload_size
            || header.uncompressed_size < header.compressed_size
        {
            return Err(self.log_error_state(UpkError::BadVersion));
        }
        for _ in 0..header.num_blocks {
            let block: Result<CompressedChunkBlock> = (|| {
                Ok(CompressedChunkBlock {
                    compressed_size: self.stream.read_u32::<LittleEndian>()?,
                    uncompressed_size: self.stream.read_u32::<LittleEndian>()?,
                })
            })();
            match block {
                Ok(block) => header.blocks.push(block),
                Err(_) => return Err(self.log_error_state(UpkError::FileError)),
            }
        }
        self.compressed_header = header;
        self.compressed = true;
        self.fully_compressed = true;
        log_debug("Package is fully compressed, decompressing...", SENDER);
        match decompress_fully_compressed(self.stream.get_ref()) {
            Ok(bytes) => {
                self.stream = Cursor::new(bytes);
                self.read_package_header()
            }
            Err(err) => Err(self.decompress_error_state(err)),
        }
    }

    fn decompress_declared_chunks(&mut self) -> std::result::Result<(), UpkError> {
        log_debug("Package is compressed, decompressing...", SENDER);
        let flags = self.summary.compression_flags;
        let method = if flags & CompressionMethod::Lzo as u32 != 0 {
            CompressionMethod::Lzo
        } else if flags & CompressionMethod::Zlib as u32 != 0 {
            CompressionMethod::Zlib
        } else {
            log_error("Cannot decompress: unsupported compression method!", SENDER);
            return Err(self.log_error_state(UpkError::IsCompressed));
        };
        log_debug("Resetting package compression flags...", SENDER);
        let mut cleared = self.summary.clone();
        cleared.compression_flags = 0;
        cleared.package_flags &= !PackageFlags::StoreCompressed.bits();
        cleared.num_compressed_chunks = 0;
        let prefix = cleared.serialize();
        match decompress_chunked(
            self.stream.get_ref(),
            &self.summary.compressed_chunks.clone(),
            method,
            prefix,
        ) {
            Ok(bytes) => {
                self.stream = Cursor::new(bytes);
                self.read_package_header()
            }
            Err(err) => Err(self.decompress_error_state(err)),
        }
    }

    pub fn serialize_summary(&self) -> Vec<u8> {
        self.summary.serialize()
    }

    /// Serializes the whole header: summary, the three tables and the
    /// depends buffer, in file order.
    pub fn serialize_header(&self) -> Vec<u8> {
        let mut out = self.summary.serialize();
        let write: Result<()> = (|| {
            for entry in self.name_table.iter().take(self.summary.name_count as usize) {
                entry.write(&mut out)?;
            }
            for entry in self.import_table.iter().skip(1).take(self.summary.import_count as usize) {
                entry.write(&mut out)?;
            }
            for entry in self.export_table.iter().skip(1).take(self.summary.export_count as usize) {
                entry.write(&mut out)?;
            }
            out.write_all(&self.depends_buf)?;
            Ok(())
        })();
        write.unwrap_or_else(|_| unreachable!("in-memory write"));
        out
    }

    pub fn index_to_name(&self, idx: NameIndex) -> String {
        let Some(entry) = self.name_table.get(idx.index as usize) else {
            log_warn("Bad NameTableIdx in index_to_name!", SENDER);
            return "Error".into();
        };
        if idx.numeric > 0 && entry.name != "None" {
            format!("{}_{}", entry.name, idx.numeric - 1)
        } else {
            entry.name.clone()
        }
    }

    pub fn objref_to_name(&self, objref: i32) -> String {
        if -(objref as i64) >= self.import_table.len() as i64
            || objref as i64 >= self.export_table.len() as i64
        {
            log_warn("Bad ObjRef in objref_to_name!", SENDER);
            return "Error".into();
        }
        if objref == 0 {
            String::new()
        } else if objref > 0 {
            self.index_to_name(self.export_table[objref as usize].name_idx)
        } else {
            self.index_to_name(self.import_table[(-objref) as usize].name_idx)
        }
    }

    pub fn get_owner_ref(&self, objref: i32) -> i32 {
        if -(objref as i64) >= self.import_table.len() as i64
            || objref as i64 >= self.export_table.len() as i64
        {
            log_warn("Bad ObjRef in get_owner_ref!", SENDER);
            return 0;
        }
        if objref == 0 {
            0
        } else if objref > 0 {
            self.export_table[objref as usize].owner_ref
        } else {
            self.import_table[(-objref) as usize].owner_ref
        }
    }

    /// Dotted path from the outermost owner down to the entry.
    pub fn resolve_full_name(&self, objref: i32) -> String {
        let mut name = self.objref_to_name(objref);
        let mut next = self.get_owner_ref(objref);
        while next != 0 {
            name = format!("{}.{}", self.objref_to_name(next), name);
            next = self.get_owner_ref(next);
        }
        name
    }

    pub fn is_none_idx(&self, idx: NameIndex) -> bool {
        idx.index == self.none_idx
    }

    pub fn none_idx(&self) -> u32 {
        self.none_idx
    }

    pub fn find_name(&self, name: &str) -> Option<u32> {
        self.name_table.iter().position(|entry| entry.name == name).map(|i| i as u32)
    }

    pub fn find_object(&self, full_name: &str, is_export: bool) -> i32 {
        if !is_export {
            for (i, entry) in self.import_table.iter().enumerate().skip(1) {
                if entry.full_name == full_name {
                    return -(i as i32);
                }
            }
        }
        for (i, entry) in self.export_table.iter().enumerate().skip(1) {
            if entry.full_name == full_name {
                return i as i32;
            }
        }
        0
    }

    pub fn find_object_match_type(&self, full_name: &str, type_name: &str, is_export: bool) -> i32 {
        if !is_export {
            for (i, entry) in self.import_table.iter().enumerate().skip(1) {
                if entry.type_name == type_name && entry.full_name == full_name {
                    return -(i as i32);
                }
            }
        }
        for (i, entry) in self.export_table.iter().enumerate().skip(1) {
            if entry.type_name == type_name && entry.full_name == full_name {
                return i as i32;
            }
        }
        0
    }

    pub fn find_object_by_name(&self, name: &str, is_export: bool) -> i32 {
        if !is_export {
            for (i, entry) in self.import_table.iter().enumerate().skip(1) {
                if entry.name == name {
                    return -(i as i32);
                }
            }
        }
        for (i, entry) in self.export_table.iter().enumerate().skip(1) {
            if entry.name == name {
                return i as i32;
            }
        }
        0
    }

    pub fn find_object_by_offset(&self, offset: u64) -> i32 {
        for (i, entry) in self.export_table.iter().enumerate().skip(1) {
            let start = entry.serial_offset as u64;
            if offset >= start && offset < start + entry.serial_size as u64 {
                return i as i32;
            }
        }
        0
    }

    pub fn get_export_entry(&self, idx: u32) -> &ExportEntry {
        if (idx as usize) < self.export_table.len() {
            &self.export_table[idx as usize]
        } else {
            log_warn("Bad idx in get_export_entry!", SENDER);
            &self.export_table[0]
        }
    }

    pub fn get_import_entry(&self, idx: u32) -> &ImportEntry {
        if (idx as usize) < self.import_table.len() {
            &self.import_table[idx as usize]
        } else {
            log_warn("Bad idx in get_import_entry!", SENDER);
            &self.import_table[0]
        }
    }

    pub fn get_name_entry(&self, idx: u32) -> &NameEntry {
        if (idx as usize) < self.name_table.len() {
            &self.name_table[idx as usize]
        } else {
            log_warn("Bad idx in get_name_entry!", SENDER);
            &self.name_table[self.none_idx as usize]
        }
    }

    pub fn get_entry_name(&self, objref: i32) -> String {
        if objref < 0 {
            self.get_import_entry((-objref) as u32).name.clone()
        } else {
            self.get_export_entry(objref as u32).name.clone()
        }
    }

    pub fn get_entry_full_name(&self, objref: i32) -> String {
        if objref < 0 {
            self.get_import_entry((-objref) as u32).full_name.clone()
        } else {
            self.get_export_entry(objref as u32).full_name.clone()
        }
    }

    pub fn get_entry_type(&self, objref: i32) -> String {
        if objref < 0 {
            self.get_import_entry((-objref) as u32).type_name.clone()
        } else {
            self.get_export_entry(objref as u32).type_name.clone()
        }
    }

    pub fn get_entry_owner_ref(&self, objref: i32) -> i32 {
        if objref < 0 {
            self.get_import_entry((-objref) as u32).owner_ref
        } else {
            self.get_export_entry(objref as u32).owner_ref
        }
    }

    pub fn get_entry_owner_full_name(&self, objref: i32) -> String {
        self.get_entry_full_name(self.get_entry_owner_ref(objref))
    }

    pub fn get_entry_serial_size(&self, objref: i32) -> u32 {
        if objref <= 0 { 0 } else { self.get_export_entry(objref as u32).serial_size }
    }

    /// Raw payload bytes of an export; empty with a warning when the index
    /// is out of bounds or the payload overruns the stream.
    pub fn get_export_data(&self, idx: u32) -> Vec<u8> {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in get_export_data!", SENDER);
            return Vec::new();
        }
        let entry = &self.export_table[idx as usize];
        let start = entry.serial_offset as usize;
        let end = start + entry.serial_size as usize;
        let Some(data) = self.stream.get_ref().get(start..end) else {
            log_warn("Export payload overruns the stream in get_export_data!", SENDER);
            return Vec::new();
        };
        self.last_accessed_export.set(idx as i32);
        data.to_vec()
    }

    /// Raw table-entry bytes for an import or export reference.
    pub fn get_object_table_data(&self, objref: i32) -> Vec<u8> {
        if objref == 0
            || objref as i64 >= self.export_table.len() as i64
            || -(objref as i64) >= self.import_table.len() as i64
        {
            log_warn("Bad ObjRef in get_object_table_data!", SENDER);
            return Vec::new();
        }
        let (offset, size) = if objref > 0 {
            let entry = &self.export_table[objref as usize];
            (entry.entry_offset as usize, entry.entry_size as usize)
        } else {
            let entry = &self.import_table[(-objref) as usize];
            (entry.entry_offset as usize, entry.entry_size as usize)
        };
        self.stream.get_ref().get(offset..offset + size).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Deserializes an export on demand and caches the result; out-of-range
    /// lookups and failures return the sentinel null object at index zero.
    pub fn get_export_object(&mut self, idx: u32, try_unsafe: bool, quick: bool) -> &UpkObject {
        if idx > 0 && (idx as usize) < self.export_table.len() && self.deserialize(idx, try_unsafe, quick)
        {
            return &self.objects[&idx];
        }
        log_warn("Index is out of bounds in get_export_object!", SENDER);
        self.objects.entry(0).or_insert_with(UpkObject::none);
        &self.objects[&0]
    }

    pub fn deserialize(&mut self, idx: u32, try_unsafe: bool, quick: bool) -> bool {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in deserialize!", SENDER);
            return false;
        }
        if self.objects.contains_key(&idx) {
            return true;
        }
        match deserialize_export(self, idx, try_unsafe, quick) {
            Ok(object) => {
                self.objects.insert(idx, object);
                true
            }
            Err(err) => {
                log_warn(&format!("Error deserializing an object: {err}"), SENDER);
                false
            }
        }
    }

    pub fn get_script_size(&mut self, idx: u32) -> usize {
        let object = self.get_export_object(idx, false, true);
        if !object.is_structure() {
            log_warn("Object has no script in get_script_size!", SENDER);
            return 0;
        }
        object.script_serial_size() as usize
    }

    pub fn get_script_mem_size(&mut self, idx: u32) -> usize {
        let object = self.get_export_object(idx, false, true);
        if !object.is_structure() {
            log_warn("Object has no script in get_script_mem_size!", SENDER);
            return 0;
        }
        object.script_memory_size() as usize
    }

    pub fn get_script_rel_offset(&mut self, idx: u32) -> usize {
        let object = self.get_export_object(idx, false, true);
        if !object.is_structure() {
            log_warn("Object has no script in get_script_rel_offset!", SENDER);
            return 0;
        }
        object.script_offset() as usize
    }

    pub fn save_export_data(&self, idx: u32, out_dir: &str) -> Result<()> {
        if idx < 1 || idx as usize >= self.export_table.len() {
            log_warn("Index is out of bounds in save_export_data!", SENDER);
            return Ok(());
        }
        let entry = &self.export_table[idx as usize];
        let path = format!("{}/{}.{}", out_dir, entry.full_name, entry.type_name);
        fs::write(path, self.get_export_data(idx))
    }

    pub fn format_compressed_header(&self) -> String {
        let header = &self.compressed_header;
        let mut out = String::new();
        out.push_str(&format!("Signature: {}\n", format_hex(header.signature)));
        out.push_str(&format!("BlockSize: {}\n", header.block_size));
        out.push_str(&format!("CompressedSize: {}\n", header.compressed_size));
        out.push_str(&format!("UncompressedSize: {}\n", header.uncompressed_size));
        out.push_str(&format!("NumBlocks: {}\n", header.num_blocks));
        for (i, block) in header.blocks.iter().enumerate() {
            out.push_str(&format!("Blocks[{i}]:\n"));
            out.push_str(&format!("\tCompressedSize: {}\n", block.compressed_size));
            out.push_str(&format!("\tUncompressedSize: {}\n", block.uncompressed_size));
        }
        out
    }

    pub fn format_summary(&self) -> String {
        if self.fully_compressed {
            return self.format_compressed_header();
        }
        self.summary.to_string()
    }

    pub fn format_names(&self, verbose: bool) -> String {
        let mut out = String::from("NameTable:\n");
        for i in 0..self.name_table.len() {
            out.push_str(&self.format_name(i as u32, verbose));
        }
        out
    }

    pub fn format_imports(&self, verbose: bool) -> String {
        let mut out = String::from("ImportTable:\n");
        for i in 1..self.import_table.len() {
            out.push_str(&self.format_import(i as u32, verbose));
        }
        out
    }

    pub fn format_exports(&self, verbose: bool) -> String {
        let mut out = String::from("ExportTable:\n");
        for i in 1..self.export_table.len() {
            out.push_str(&self.format_export(i as u32, verbose));
        }
        out
    }

    pub fn format_name(&self, idx: u32, verbose: bool) -> String {
        let entry = self.get_name_entry(idx);
        let mut out = format!(
            "{} ({}) ( {}): {}\n",
            format_hex(idx),
            idx,
            format_hex_bytes(&idx.to_le_bytes()),
            entry.name
        );
        if verbose {
            out.push_str(&format!("\tNameFlagsL: {}\n", format_hex(entry.flags_l)));
            out.push_str(&format!("\tNameFlagsH: {}\n", format_hex(entry.flags_h)));
        }
        out
    }

    pub fn format_import(&self, idx: u32, verbose: bool) -> String {
        let objref = -(idx as i32);
        let entry = self.get_import_entry(idx);
        let mut out = format!(
            "{} ({}) ( {}): {}'{}'\n",
            format_hex(objref as u32),
            objref,
            format_hex_bytes(&objref.to_le_bytes()),
            entry.type_name,
            entry.full_name
        );
        if verbose {
            out.push_str(&format!(
                "\tPackageIdx: {} -> {}\n",
                format_hex_name(entry.package_idx),
                self.index_to_name(entry.package_idx)
            ));
            out.push_str(&format!(
                "\tTypeIdx: {} -> {}\n",
                format_hex_name(entry.type_idx),
                self.index_to_name(entry.type_idx)
            ));
            out.push_str(&format!(
                "\tOwnerRef: {} -> {}\n",
                format_hex(entry.owner_ref as u32),
                self.objref_to_name(entry.owner_ref)
            ));
            out.push_str(&format!(
                "\tNameIdx: {} -> {}\n",
                format_hex_name(entry.name_idx),
                self.index_to_name(entry.name_idx)
            ));
        }
        out
    }

    pub fn format_export(&self, idx: u32, verbose: bool) -> String {
        let entry = self.get_export_entry(idx);
        let mut out = format!(
            "{} ({}) ( {}): {}'{}'\n",
            format_hex(idx),
            idx,
            format_hex_bytes(&idx.to_le_bytes()),
            entry.type_name,
            entry.full_name
        );
        if verbose {
            out.push_str(&format!(
                "\tTypeRef: {} -> {}\n",
                format_hex(entry.type_ref as u32),
                self.objref_to_name(entry.type_ref)
            ));
            out.push_str(&format!(
                "\tParentClassRef: {} -> {}\n",
                format_hex(entry.parent_class_ref as u32),
                self.objref_to_name(entry.parent_class_ref)
            ));
            out.push_str(&format!(
                "\tOwnerRef: {} -> {}\n",
                format_hex(entry.owner_ref as u32),
                self.objref_to_name(entry.owner_ref)
            ));
            out.push_str(&format!(
                "\tNameIdx: {} -> {}\n",
                format_hex_name(entry.name_idx),
                self.index_to_name(entry.name_idx)
            ));
            out.push_str(&format!(
                "\tArchetypeRef: {} -> {}\n",
                format_hex(entry.archetype_ref as u32),
                self.objref_to_name(entry.archetype_ref)
            ));
            out.push_str(&format!("\tObjectFlagsH: {}\n", format_hex(entry.object_flags_h)));
            out.push_str(&flag_lines(&ObjectFlagsH::from_bits_truncate(entry.object_flags_h)));
            out.push_str(&format!("\tObjectFlagsL: {}\n", format_hex(entry.object_flags_l)));
            out.push_str(&flag_lines(&ObjectFlagsL::from_bits_truncate(entry.object_flags_l)));
            out.push_str(&format!(
                "\tSerialSize: {} ({})\n",
                format_hex(entry.serial_size),
                entry.serial_size
            ));
            out.push_str(&format!("\tSerialOffset: {}\n", format_hex(entry.serial_offset)));
            out.push_str(&format!("\tExportFlags: {}\n", format_hex(entry.export_flags)));
            out.push_str(&flag_lines(&ExportFlags::from_bits_truncate(entry.export_flags)));
            out.push_str(&format!("\tNetObjectCount: {}\n", entry.net_object_count));
            out.push_str(&format!("\tGUID: {}\n", format_hex_guid(entry.guid)));
            out.push_str(&format!("\tUnknown1: {}\n", format_hex(entry.unknown1)));
            for (i, net) in entry.net_objects.iter().enumerate() {
                out.push_str(&format!("\tNetObjects[{i}]: {}\n", format_hex(*net)));
            }
        }
        out
    }
}
