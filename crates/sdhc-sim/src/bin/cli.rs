use std::io::{Read, Write};
use std::sync::Arc;

use clap::Parser;
use sdhc::Host;
use sdhc_sim::{Args, CliCommand, HostStream, SimBench};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BLOCK: usize = 512;

/// Outcome of a subcommand that ran to completion
enum Verdict {
    Pass,
    Mismatch,
}

fn hex_dump(base: u64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:08X}  {:<47}  {}", base + (i * 16) as u64, hex.join(" "), ascii);
    }
}

fn print_info(host: &Host) -> Result<(), String> {
    let card = host.card_info().ok_or("no card enumerated")?;
    println!("Card type:     {:?}", card.card_type);
    println!("RCA:           {:#06X}", card.rca);
    println!("OCR:           {:#010X}", card.ocr);
    if let Some(cid) = &card.cid {
        println!(
            "CID:           {} rev {:#04X}, manufacturer {:#04X}, serial {:#010X}, {:04}-{:02}",
            cid.product_name, cid.revision, cid.manufacturer_id, cid.serial, cid.year, cid.month
        );
    }
    if card.card_type.has_memory() {
        let blocks = card.capacity_blocks();
        println!("Capacity:      {} blocks ({} MiB)", blocks, blocks / 2048);
    }
    if let Some(sdio) = &card.sdio {
        println!("SDIO:          {:?}", sdio);
    }
    println!("Timing:        {:?}", host.speed_mode());
    println!("Bus width:     {} bit", host.bus_width().lines());
    println!("Clock:         {} Hz", host.clock_hz());
    let bus = host.bus_info();
    println!("Transfer mode: {:?} ({:?})", bus.transfer_mode, bus.auto_cmd);
    println!("Signalling:    {} mV supply", bus.voltage_mv);
    Ok(())
}

fn block_index(block: u64) -> Result<u32, String> {
    u32::try_from(block).map_err(|_| format!("block {} is out of range", block))
}

fn pattern_buffer(pattern: u64, blocks: u32) -> Vec<u8> {
    vec![pattern as u8; blocks as usize * BLOCK]
}

fn run(args: &Args, bench: &SimBench) -> Result<Verdict, String> {
    let host = bench.host(0, 0).map_err(|e| e.to_string())?;
    let card_type = host.init_card().map_err(|e| format!("Card initialization failed: {}", e))?;
    info!("Enumerated {:?}", card_type);

    match &args.command {
        CliCommand::Info => print_info(host)?,
        CliCommand::Read { block, count, output } => {
            let mut buf = vec![0u8; *count as usize * BLOCK];
            host.get_data(block_index(*block)?, &mut buf)
                .map_err(|e| format!("Read failed: {}", e))?;
            match output {
                Some(path) => std::fs::write(path, &buf).map_err(|e| format!("Failed to write {:?}: {}", path, e))?,
                None => hex_dump(*block * BLOCK as u64, &buf),
            }
        }
        CliCommand::Write { block, input, pattern, count } => {
            let data = match (input, pattern) {
                (Some(path), _) => std::fs::read(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?,
                (None, Some(p)) => pattern_buffer(*p, *count),
                (None, None) => return Err("nothing to write".to_string()),
            };
            let n = host
                .send_data(block_index(*block)?, &data)
                .map_err(|e| format!("Write failed: {}", e))?;
            info!("Wrote {} bytes at block {}", n, block);
        }
        CliCommand::Erase { start, end, kind } => {
            host.erase(block_index(*start)?, block_index(*end + 1)?, (*kind).into())
                .map_err(|e| format!("Erase failed: {}", e))?;
            info!("Erased blocks {}..={}", start, end);
        }
        CliCommand::Verify { block, count, pattern } => {
            let block = block_index(*block)?;
            let expected = pattern_buffer(*pattern, *count);
            host.send_data(block, &expected).map_err(|e| format!("Write failed: {}", e))?;
            let mut back = vec![0u8; expected.len()];
            host.get_data(block, &mut back).map_err(|e| format!("Read failed: {}", e))?;
            if let Some(at) = expected.iter().zip(&back).position(|(a, b)| a != b) {
                eprintln!(
                    "Mismatch at byte {} (block {}): wrote {:#04X}, read {:#04X}",
                    at,
                    block as usize + at / BLOCK,
                    expected[at],
                    back[at]
                );
                return Ok(Verdict::Mismatch);
            }
            println!("Verified {} blocks at {}", count, block);
        }
        CliCommand::ExtCsd => {
            let ext_csd = host.read_ext_csd().map_err(|e| format!("EXT_CSD read failed: {}", e))?;
            hex_dump(0, ext_csd.raw());
            println!("Revision {}, {} sectors", ext_csd.revision(), ext_csd.sector_count());
        }
        CliCommand::Ls { path } => {
            let stream = HostStream::new(Arc::clone(host)).map_err(|e| e.to_string())?;
            let fs = fatfs::FileSystem::new(fscommon::BufStream::new(stream), fatfs::FsOptions::new())
                .map_err(|e| format!("Failed to mount FAT volume: {}", e))?;
            let root = fs.root_dir();
            let dir = match path.trim_matches('/') {
                "" => root,
                sub => root.open_dir(sub).map_err(|e| format!("Failed to open {}: {}", path, e))?,
            };
            for entry in dir.iter() {
                let entry = entry.map_err(|e| format!("Failed to list {}: {}", path, e))?;
                let marker = if entry.is_dir() { "/" } else { "" };
                println!("{:>10}  {}{}", entry.len(), entry.file_name(), marker);
            }
        }
        CliCommand::Cat { path } => {
            let stream = HostStream::new(Arc::clone(host)).map_err(|e| e.to_string())?;
            let fs = fatfs::FileSystem::new(fscommon::BufStream::new(stream), fatfs::FsOptions::new())
                .map_err(|e| format!("Failed to mount FAT volume: {}", e))?;
            let mut file = fs
                .root_dir()
                .open_file(path.trim_start_matches('/'))
                .map_err(|e| format!("Failed to open {}: {}", path, e))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| format!("Failed to read {}: {}", path, e))?;
            std::io::stdout()
                .write_all(&contents)
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(Verdict::Pass)
}

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Initialize logging
    let filter = if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== Creating Bench ===");
    let bench = match SimBench::new(args.to_bench_config()) {
        Ok(bench) => bench,
        Err(e) => {
            eprintln!("Failed to create bench: {}", e);
            std::process::exit(2);
        }
    };

    let exit_code = match run(&args, &bench) {
        Ok(Verdict::Pass) => 0,
        Ok(Verdict::Mismatch) => 1,
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    };
    std::process::exit(exit_code);
}
