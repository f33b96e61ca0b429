use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow};
use clap::Parser;

use upk_tools::logservice::{ConsoleLog, LogLevel, log_error, provide_log, set_log_level};
use upk_tools::upkextract;
use upk_tools::upkreader::UpkPackage;

const SENDER: &str = "upk-tools";
const LOGO: &str = "UE3 package reader and editor";

#[derive(Parser)]
#[command(name = "upk-tools", about = LOGO, version)]
struct Cli {
    /// Package file name
    file: String,

    /// Be verbose
    #[arg(short, long)]
    verbose: bool,

    /// Log level (0 = errors only .. 4 = everything)
    #[arg(short = 'l', long = "loglevel")]
    loglevel: Option<i64>,

    /// Copy the input package to the output dir before touching it
    #[arg(short, long)]
    backup: bool,

    /// Input directory
    #[arg(short, long, default_value = ".")]
    input: String,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: String,

    /// Save the decompressed package
    #[arg(short, long)]
    decompress: bool,

    /// Dump the name/import/export tables
    #[arg(short, long)]
    tables: bool,

    /// Find an entry by full name and dump its deserialization
    #[arg(short, long)]
    entry: Option<String>,

    /// Find an export by file byte offset and dump its deserialization
    #[arg(short = 'f', long)]
    offset: Option<u64>,

    /// Save the found export's serialized payload bytes
    #[arg(short, long)]
    serialized: bool,

    /// Extract objects whose full names match a regular expression
    #[arg(short = 'x', long)]
    extract: Option<String>,

    /// Compare to another package
    #[arg(short, long)]
    compare: Option<String>,
}

fn fail(message: &str) -> anyhow::Error {
    log_error(message, SENDER);
    anyhow!("{message}")
}

fn run(cli: &Cli) -> Result<()> {
    if cli.verbose {
        println!("{LOGO}");
    }
    let input_dir = PathBuf::from(&cli.input);
    let output_dir = PathBuf::from(&cli.output);
    if cli.verbose {
        println!("Input dir name: {}", input_dir.display());
        println!("Output dir name: {}", output_dir.display());
    }
    if !output_dir.is_dir() && fs::create_dir_all(&output_dir).is_err() {
        return Err(fail(&format!(
            "Output directory does not exist: {}",
            output_dir.display()
        )));
    }
    let upk_path = input_dir.join(&cli.file);
    let upk_name = upk_path.to_string_lossy().into_owned();
    if cli.verbose {
        println!("Upk file full path: {upk_name}");
    }
    if !upk_path.is_file() {
        return Err(fail(&format!("Cannot find upk file: {upk_name}")));
    }
    let file_name = upk_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.file.clone());
    let file_stem = upk_path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.file.clone());

    if cli.backup {
        let backup_path = output_dir.join(format!("{file_name}.bak"));
        if fs::copy(&upk_path, &backup_path).is_err() {
            return Err(fail(&format!(
                "Error writing backup to: {}",
                backup_path.display()
            )));
        }
        if cli.verbose {
            println!("Backup saved to: {}", backup_path.display());
        }
    }

    if cli.verbose {
        println!("Reading package: {upk_name}");
    }
    let mut package = match UpkPackage::load_file(&upk_name) {
        Ok(package) => package,
        Err(_) => return Err(fail(&format!("Error reading package: {upk_name}"))),
    };

    if cli.decompress {
        let decompressed_path = output_dir.join(&file_name);
        let decompressed_name = decompressed_path.to_string_lossy().into_owned();
        if package.save_package(Some(&decompressed_name)).is_err() {
            return Err(fail(&format!(
                "Error saving decompressed package to: {decompressed_name}"
            )));
        }
        if cli.verbose {
            println!("Decompressed package saved to: {decompressed_name}");
        }
    }

    if let Some(name_mask) = &cli.extract {
        let base_dir = output_dir.join(&file_stem);
        upkextract::extract_package_objects(&mut package, &base_dir, name_mask)?;
        if cli.verbose {
            println!("Package extracted to dir: {}", output_dir.display());
        }
    } else if cli.tables {
        let list_path = output_dir.join(format!("{file_stem}.txt"));
        upkextract::extract_package_header(&package, &list_path)?;
        if cli.verbose {
            println!("Tables extracted to: {}", list_path.display());
        }
    }

    let mut objref = 0;
    let mut entry_full_name = String::new();
    let mut save_deserialized = false;
    if let Some(entry) = &cli.entry {
        objref = package.find_object(entry, false);
        if objref == 0 {
            return Err(fail(&format!("Cannot find object entry by name: {entry}")));
        }
        if cli.verbose {
            println!("Entry found!");
        }
        entry_full_name = entry.clone();
        save_deserialized = true;
    }
    if let Some(offset) = cli.offset {
        objref = package.find_object_by_offset(offset);
        if objref <= 0 {
            return Err(fail("Cannot find object by specified offset!"));
        }
        entry_full_name = package.get_entry_full_name(objref);
        if cli.verbose {
            println!("Entry found: {entry_full_name}");
        }
        save_deserialized = true;
    }
    if save_deserialized {
        let entry_path = output_dir.join(format!("{entry_full_name}.txt"));
        upkextract::extract_entry(&mut package, objref, &entry_path)?;
        if cli.verbose && entry_path.is_file() {
            println!("Entry extracted to: {}", entry_path.display());
        }
    }
    if cli.serialized && objref > 0 {
        let out_dir = output_dir.to_string_lossy().into_owned();
        if package.save_export_data(objref as u32, &out_dir).is_err() {
            return Err(fail("Error saving export serialized data!"));
        }
        if cli.verbose {
            println!("Entry binary data saved to dir: {out_dir}");
        }
    }

    if let Some(other_file) = &cli.compare {
        let other_path = input_dir.join(other_file);
        let other_name = other_path.to_string_lossy().into_owned();
        if cli.verbose {
            println!("Reading package: {other_name}");
        }
        let other_package = match UpkPackage::load_file(&other_name) {
            Ok(other) => other,
            Err(_) => return Err(fail(&format!("Error reading package: {other_name}"))),
        };
        let report_path = output_dir.join("compare_log.txt");
        if cli.verbose {
            println!("Comparing packages...");
        }
        upkextract::compare_packages(&package, &other_package, &report_path)?;
        if cli.verbose {
            println!("Comparison results saved to {}", report_path.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    provide_log(Box::new(ConsoleLog));
    let cli = Cli::parse();
    let log_level = cli.loglevel.unwrap_or(LogLevel::Error as i64);
    set_log_level(LogLevel::from_raw(log_level));
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
