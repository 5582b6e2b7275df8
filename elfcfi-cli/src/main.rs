use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use elfcfi_core::frame::encoding_name;
use elfcfi_core::{ElfReader, FrameKind, FrameTables};
use goblin::elf::header::et_to_str;
use log::debug;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Inspect ELF structure and call frame information
#[derive(Parser)]
#[command(
    name = "elfcfi",
    about = "Inspect ELF headers, segments and .eh_frame/.debug_frame records",
    version,
    author
)]
struct Cli {
    /// Path to binary file
    #[arg(required = true)]
    path: std::path::PathBuf,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the file header
    Header,
    /// List all named sections
    Sections,
    /// List program headers and the lowest executable load address
    Segments,
    /// List Common Information Entries
    Cies {
        #[arg(long, default_value = "eh_frame")]
        section: FrameKind,
    },
    /// List Frame Description Entries
    Fdes {
        #[arg(long, default_value = "eh_frame")]
        section: FrameKind,
    },
    /// Find the FDE covering an address
    Lookup {
        /// Address, hex with 0x prefix or decimal
        #[arg(value_parser = parse_addr)]
        addr: u64,
        #[arg(long, default_value = "eh_frame")]
        section: FrameKind,
    },
}

#[derive(Tabled, Serialize)]
struct SectionRow {
    #[tabled(rename = "Section")]
    name: String,
    #[tabled(rename = "Type")]
    kind: &'static str,
    #[tabled(rename = "Addr")]
    addr: String,
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled, Serialize)]
struct SegmentRow {
    #[tabled(rename = "Type")]
    kind: &'static str,
    #[tabled(rename = "Flags")]
    flags: String,
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "VirtAddr")]
    vaddr: String,
    #[tabled(rename = "PhysAddr")]
    paddr: String,
    #[tabled(rename = "FileSiz")]
    filesz: String,
}

#[derive(Tabled, Serialize)]
struct CieRow {
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "Version")]
    version: u8,
    #[tabled(rename = "Augmentation")]
    augmentation: String,
    #[tabled(rename = "DataAlign")]
    data_alignment_factor: i64,
    #[tabled(rename = "FDE encoding")]
    fde_encoding: String,
    #[tabled(rename = "LSDA encoding")]
    lsda_encoding: String,
    #[tabled(rename = "Insts")]
    instructions: usize,
}

#[derive(Tabled, Serialize)]
struct FdeRow {
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "CIE")]
    cie: String,
    #[tabled(rename = "Start")]
    start: String,
    #[tabled(rename = "End")]
    end: String,
    #[tabled(rename = "Size")]
    size: u64,
    #[tabled(rename = "Insts")]
    instructions: usize,
}

fn hex(value: u64) -> String {
    format!("{value:#x}")
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid address {s:?}: {err}"))
}

fn emit<T: Tabled + Serialize>(rows: Vec<T>, json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("{empty}");
    } else {
        println!("{}", Table::new(rows).with(Style::psql()));
    }
    Ok(())
}

/// Decodes `kind`, falling back to the records read before a recoverable
/// failure so they can still be shown.
fn frame_tables(reader: &ElfReader, kind: FrameKind) -> Result<Arc<FrameTables>> {
    debug!("decoding {kind} from {}", reader.path().display());
    match reader.read_frame_section(kind) {
        Ok(tables) => Ok(tables),
        Err(err) => match reader.frame_tables(kind) {
            Some(partial) if !err.is_fatal() => {
                eprintln!(
                    "{} {err}; showing {} CIEs and {} FDEs decoded before the failure",
                    "warning:".yellow().bold(),
                    partial.cies().len(),
                    partial.fdes().len()
                );
                Ok(partial)
            }
            _ => Err(err).with_context(|| format!("failed to decode {kind}")),
        },
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let reader = ElfReader::open(&cli.path)
        .with_context(|| format!("failed to open {}", cli.path.display()))?;

    match cli.command {
        Command::Header => {
            let header = reader.header();
            println!("{}", reader.path().display().to_string().bold());
            println!("Class:        ELF{}", reader.class().bits());
            println!("Type:         {}", et_to_str(header.e_type));
            println!("Machine:      {}", header.e_machine);
            println!("Entry point:  0x{:x}", header.e_entry);
            println!("Sections:     {} at 0x{:x}", header.e_shnum, header.e_shoff);
            println!("Segments:     {} at 0x{:x}", header.e_phnum, header.e_phoff);
        }

        Command::Sections => {
            let rows: Vec<SectionRow> = reader
                .sections()
                .values()
                .map(|s| SectionRow {
                    name: s.name.clone(),
                    kind: s.type_name(),
                    addr: hex(s.addr),
                    offset: hex(s.offset),
                    size: hex(s.size),
                })
                .collect();
            emit(rows, cli.json, "No named sections found.")?;
        }

        Command::Segments => {
            let rows: Vec<SegmentRow> = reader
                .program_headers()
                .iter()
                .map(|ph| SegmentRow {
                    kind: ph.type_name(),
                    flags: ph.flags_string(),
                    offset: hex(ph.offset),
                    vaddr: hex(ph.vaddr),
                    paddr: hex(ph.paddr),
                    filesz: hex(ph.filesz),
                })
                .collect();
            emit(rows, cli.json, "No program headers found.")?;
            if !cli.json {
                match reader.min_load_vaddr() {
                    Some(vaddr) => println!("Lowest executable load address: 0x{vaddr:x}"),
                    None => println!("No executable PT_LOAD segment."),
                }
            }
        }

        Command::Cies { section } => {
            let tables = frame_tables(&reader, section)?;
            let rows: Vec<CieRow> = tables
                .cies()
                .values()
                .map(|cie| CieRow {
                    offset: hex(cie.offset),
                    version: cie.version,
                    augmentation: cie.augmentation.clone(),
                    data_alignment_factor: cie.data_alignment_factor,
                    fde_encoding: encoding_name(cie.fde_pointer_encoding),
                    lsda_encoding: if cie.has_lsda() {
                        encoding_name(cie.lsda_encoding)
                    } else {
                        "-".to_string()
                    },
                    instructions: cie.instructions().len(),
                })
                .collect();
            emit(rows, cli.json, &format!("No CIEs in {section}."))?;
        }

        Command::Fdes { section } => {
            let tables = frame_tables(&reader, section)?;
            let rows: Vec<FdeRow> = tables
                .fdes()
                .values()
                .map(|fde| FdeRow {
                    offset: hex(fde.offset),
                    cie: hex(fde.cie.offset),
                    start: hex(fde.func_start),
                    end: hex(fde.func_end),
                    size: fde.len(),
                    instructions: fde.instructions().len(),
                })
                .collect();
            emit(rows, cli.json, &format!("No FDEs in {section}."))?;
        }

        Command::Lookup { addr, section } => {
            let tables = frame_tables(&reader, section)?;
            match tables.find_fde(addr) {
                Some(fde) => {
                    println!(
                        "0x{addr:x} is in [0x{:x} - 0x{:x}) (FDE at 0x{:x}, CIE at 0x{:x})",
                        fde.func_start, fde.func_end, fde.offset, fde.cie.offset
                    );
                    println!("Pointer encoding: {}", encoding_name(fde.pointer_encoding()));
                    println!("Instructions: {:02x?}", fde.instructions());
                }
                None => println!("No FDE in {section} covers 0x{addr:x}."),
            }
        }
    }

    Ok(())
}
