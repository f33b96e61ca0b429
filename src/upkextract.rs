use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;
use ron::ser::{PrettyConfig, to_string_pretty};

use crate::logservice::{log_debug, log_error, log_message};
use crate::upkreader::{ExportEntry, UpkPackage};

const SENDER: &str = "UpkExtract";

/// Writes an entry dump: the verbose table fields, and for exports the
/// deserialization trace obtained under unsafe parsing.
pub fn extract_entry(package: &mut UpkPackage, objref: i32, path: &Path) -> Result<()> {
    if objref == 0 {
        log_error("Null object reference in extract_entry!", SENDER);
        bail!("null object reference");
    }
    let text = if objref < 0 {
        format!("{}\n", package.format_import((-objref) as u32, true))
    } else {
        let header = package.format_export(objref as u32, true);
        let object = package.get_export_object(objref as u32, true, false);
        format!("{header}\nAttempting deserialization:\n{}\n", object.text())
    };
    fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))
}

/// Full header dump: summary plus the three tables.
pub fn extract_package_header(package: &UpkPackage, path: &Path) -> Result<()> {
    let text = format!(
        "{}\n{}\n{}\n{}",
        package.format_summary(),
        package.format_names(false),
        package.format_imports(false),
        package.format_exports(false)
    );
    fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))
}

/// Maps a dotted full name onto a directory tree under `dir`, creating the
/// intermediate directories.
fn create_path(full_name: &str, dir: &Path) -> Result<PathBuf> {
    let mut current = dir.to_path_buf();
    let parts: Vec<&str> = full_name.split('.').collect();
    let (leaf, owners) = parts.split_last().unwrap_or((&full_name, &[]));
    for owner in owners {
        current.push(owner);
    }
    fs::create_dir_all(&current)
        .with_context(|| format!("cannot create {}", current.display()))?;
    current.push(format!("{leaf}.txt"));
    Ok(current)
}

/// Extracts every export whose full name matches the mask: a text trace per
/// object, and a RON dump of the default properties when they parsed.
pub fn extract_package_objects(package: &mut UpkPackage, out_dir: &Path, name_mask: &str) -> Result<()> {
    let mask = match Regex::new(name_mask) {
        Ok(mask) => mask,
        Err(_) => {
            log_error("Invalid regular expression in extract_package_objects!", SENDER);
            bail!("invalid regular expression");
        }
    };
    let list_path = out_dir.with_extension("txt");
    extract_package_header(package, &list_path)?;
    let targets: Vec<(u32, String)> = package
        .get_export_table()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, entry)| mask.is_match(&entry.full_name))
        .map(|(i, entry)| (i as u32, entry.full_name.clone()))
        .collect();
    if targets.is_empty() {
        log_message(&format!("No exports match {name_mask} in package."), SENDER);
    }
    for (idx, full_name) in targets {
        log_debug(&full_name, SENDER);
        let file_path = create_path(&full_name, out_dir)?;
        let header = package.format_export(idx, true);
        let object = package.get_export_object(idx, true, false);
        let text = format!("{header}\n{}\n", object.text());
        let properties = object.properties.clone();
        fs::write(&file_path, text)
            .with_context(|| format!("cannot write {}", file_path.display()))?;
        if let Some(properties) = properties
            && properties.properties.len() > 1
        {
            let config = PrettyConfig::new().struct_names(true);
            if let Ok(ron_text) = to_string_pretty(&(full_name, &properties), config) {
                fs::write(file_path.with_extension("ron"), ron_text)?;
            }
        }
    }
    Ok(())
}

fn compare_export_entries(a: &ExportEntry, b: &ExportEntry, ignore_offsets: bool) -> bool {
    if a.name != b.name
        || a.full_name != b.full_name
        || a.type_name != b.type_name
        || a.parent_class_ref != b.parent_class_ref
        || a.archetype_ref != b.archetype_ref
        || a.object_flags_h != b.object_flags_h
        || a.object_flags_l != b.object_flags_l
        || a.export_flags != b.export_flags
        || a.serial_size != b.serial_size
        || a.entry_size != b.entry_size
    {
        return false;
    }
    if !ignore_offsets && a.serial_offset != b.serial_offset {
        return false;
    }
    true
}

/// Compares two parsed packages entry by entry and writes a report. An
/// entry is reported as not found when the lookup in the other package
/// returns the null reference.
pub fn compare_packages(first: &UpkPackage, second: &UpkPackage, path: &Path) -> Result<()> {
    let mut out = String::new();
    let s1 = first.get_summary();
    let s2 = second.get_summary();
    let n1 = first.get_package_name();
    let n2 = second.get_package_name();
    if s1.version != s2.version {
        out.push_str(&format!("{n1} version: {}\t{n2} version: {}\n", s1.version, s2.version));
    }
    if s1.name_count != s2.name_count {
        out.push_str(&format!(
            "{n1} NameCount: {}\t{n2} NameCount: {}\n",
            s1.name_count, s2.name_count
        ));
    }
    if s1.export_count != s2.export_count {
        out.push_str(&format!(
            "{n1} ExportCount: {}\t{n2} ExportCount: {}\n",
            s1.export_count, s2.export_count
        ));
    }
    if s1.import_count != s2.import_count {
        out.push_str(&format!(
            "{n1} ImportCount: {}\t{n2} ImportCount: {}\n",
            s1.import_count, s2.import_count
        ));
    }

    out.push_str(&format!("Comparing {n1} name table entries to {n2} name table entries.\n"));
    let mut names_not_found = 0u32;
    for (i, entry) in first.get_name_table().iter().enumerate() {
        if second.find_name(&entry.name).is_none() {
            out.push_str(&format!("{} (index = {i}) is not found.\n", entry.name));
            names_not_found += 1;
        }
    }
    if names_not_found > 0 {
        out.push_str(&format!("Number of names not found: {names_not_found}\n"));
    }

    out.push_str(&format!("Comparing {n1} import table entries to {n2} import table entries.\n"));
    let mut imports_not_found = 0u32;
    let mut imports_different = 0u32;
    for i in 1..=s1.import_count as i32 {
        let full_name = first.get_entry_full_name(-i);
        let type_name = first.get_entry_type(-i);
        let found = second.find_object_match_type(&full_name, &type_name, false);
        if found == 0 {
            out.push_str(&format!("{full_name} (index = {}) is not found.\n", -i));
            imports_not_found += 1;
        } else {
            let mut different = false;
            if found != -i {
                out.push_str(&format!("{full_name} index {} was changed to {found}.\n", -i));
                different = true;
            }
            if first.get_object_table_data(-i) != second.get_object_table_data(found) {
                out.push_str(&format!("{full_name} ImportTable data was changed.\n"));
                different = true;
            }
            imports_different += different as u32;
        }
    }
    if imports_not_found > 0 {
        out.push_str(&format!("Number of imports not found: {imports_not_found}\n"));
    }
    if imports_different > 0 {
        out.push_str(&format!("Number of different imports: {imports_different}\n"));
    }

    out.push_str(&format!("Comparing {n1} exports to {n2} exports.\n"));
    let mut exports_not_found = 0u32;
    let mut exports_different = 0u32;
    for i in 1..=s1.export_count as i32 {
        let full_name = first.get_entry_full_name(i);
        let type_name = first.get_entry_type(i);
        let found = second.find_object_match_type(&full_name, &type_name, true);
        if found <= 0 {
            out.push_str(&format!("{full_name} (index = {i}) is not found.\n"));
            exports_not_found += 1;
        } else {
            let mut different = false;
            if found != i {
                out.push_str(&format!("{full_name} index {i} was changed to {found}.\n"));
                different = true;
            }
            if !compare_export_entries(
                first.get_export_entry(i as u32),
                second.get_export_entry(found as u32),
                true,
            ) {
                out.push_str(&format!("{full_name} ExportTable data was changed.\n"));
                different = true;
            }
            if first.get_export_data(i as u32) != second.get_export_data(found as u32) {
                out.push_str(&format!("{full_name} serialized data was changed.\n"));
                different = true;
            }
            exports_different += different as u32;
        }
    }
    if exports_not_found > 0 {
        out.push_str(&format!("Number of exports not found: {exports_not_found}\n"));
    }
    if exports_different > 0 {
        out.push_str(&format!("Number of different exports: {exports_different}\n"));
    }

    fs::write(path, out).with_context(|| format!("cannot write {}", path.display()))
}
