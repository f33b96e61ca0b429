//! Reader and editor for UE3-era package containers.
//!
//! A package file bundles a name table, an import table, an export table and
//! a serialized payload per export. [`upkreader::UpkPackage`] loads one
//! (decompressing LZO or zlib compressed files on the way in), resolves the
//! cross-references between tables, deserializes export payloads into typed
//! object trees on demand, and supports offset-preserving edits: overwrite
//! and resize in place, move to end of file with an undo trailer, and adding
//! table entries.

pub mod logservice;
pub mod upkdecompress;
pub mod upkedit;
pub mod upkextract;
pub mod upkobjects;
pub mod upkprops;
pub mod upkreader;
pub mod upkregistry;

#[cfg(test)]
mod testpkg;
