//! espimage - ELF to flash image converter and serial flasher
//!
//! Converts linked ELF firmware into the bootloader's flash image formats
//! and, when a serial port is given, programs the resulting regions over the
//! ROM bootloader protocol.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use espimage::{
    BootloaderClient, ElfFile, ImageHeader, ProgrammableRegion, ProgressCallback, SerialChannel,
    build_regions, DEFAULT_RESET_SEQUENCE,
};
use log::{error, info};

#[derive(Parser)]
#[command(name = "espimage")]
#[command(about = "Convert ELF firmware to flash images and program them over serial", long_about = None)]
struct Cli {
    /// ELF files to convert
    #[arg(value_name = "ELF_FILE", required = true)]
    elf_files: Vec<PathBuf>,

    /// SPI flash mode (qio, qout, dio, dout)
    #[arg(long, default_value = "qio")]
    mode: String,

    /// SPI flash size (2m, 4m, 8m, 16m, 32m, 16m-c1, 32m-c1, 32m-c2)
    #[arg(long, default_value = "4m")]
    size: String,

    /// SPI flash frequency (20m, 26m, 40m, 80m)
    #[arg(long, default_value = "40m")]
    freq: String,

    /// Bootloader binary to pair with OTA application images
    #[arg(long, value_name = "BOOT_BIN")]
    boot: Option<PathBuf>,

    /// Serial port to program; without it the tool only writes image files
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Control-line reset sequence used to enter the bootloader
    #[arg(long, default_value = DEFAULT_RESET_SEQUENCE)]
    reset_sequence: String,

    /// Delay in milliseconds for each SLEEP step of the reset sequence
    #[arg(long, default_value_t = 50)]
    reset_delay_ms: u64,

    /// Leave the device in the bootloader instead of rebooting when done
    #[arg(long)]
    no_reboot: bool,
}

fn print_region_table(regions: &[ProgrammableRegion]) {
    for region in regions {
        println!(
            "  0x{:06x}  {:>8} bytes  {}",
            region.offset,
            region.size,
            region.file_name.display()
        );
    }
}

async fn flash_regions(cli: &Cli, regions: &[ProgrammableRegion]) -> Result<(), Box<dyn std::error::Error>> {
    let port = cli.port.as_deref().unwrap_or_default();
    let channel = SerialChannel::open(port, cli.baud)?;
    let mut client = BootloaderClient::new(
        channel,
        Duration::from_millis(cli.reset_delay_ms),
        Some(&cli.reset_sequence),
    )?;

    info!("Connecting to the bootloader on {port}");
    client.sync().await?;

    for region in regions {
        let data = std::fs::read(&region.file_name)?;
        println!(
            "Writing {} ({} bytes at 0x{:06x})",
            region.file_name.display(),
            data.len(),
            region.offset
        );

        let total = data.len();
        let base = region.offset;
        let mut written = 0usize;
        let progress: ProgressCallback = Box::new(move |_address, count| {
            written += count;
            let percent = written * 100 / total.max(1);
            let filled = percent / 5;
            print!("\r[{}{}] {percent:3}%", "#".repeat(filled), " ".repeat(20 - filled));
            let _ = std::io::stdout().flush();
            Ok(())
        });
        client
            .program_flash_with_progress(base, &data, Some(progress))
            .await?;
        println!();
    }

    client.run_program(false, !cli.no_reboot).await?;
    if cli.no_reboot {
        println!("Done, device left in the bootloader");
    } else {
        println!("Done, device rebooted into the new firmware");
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let header = ImageHeader::new(&cli.freq, &cli.mode, &cli.size)?;

    let mut all_regions = Vec::new();
    for elf_path in &cli.elf_files {
        info!("Processing {}", elf_path.display());
        let elf = ElfFile::open(elf_path)?;
        let base = elf_path.with_extension("");
        let regions = build_regions(&elf, &base, header, cli.boot.as_deref())?;
        println!("{}:", elf_path.display());
        print_region_table(&regions);
        all_regions.extend(regions);
    }

    if cli.port.is_some() {
        flash_regions(cli, &all_regions).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
