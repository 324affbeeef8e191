use clap::Parser;
use mbr_nostd::{MasterBootRecord, PartitionTable};
use pretty_hex::pretty_hex;
use sdmmc::{bus::linux, delay::std::Delay, BLOCK_SIZE, SD};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Specify SPI device
    #[clap(short, long, value_parser)]
    spi: String,

    /// Specify chip-select GPIO number
    #[clap(short, long, value_parser)]
    cs: u16,

    /// Sector to dump
    #[clap(long, value_parser, default_value_t = 0)]
    sector: u32,

    /// SPI clock after initialization in Hz
    #[clap(long, value_parser, default_value_t = linux::DEFAULT_FAST_HZ)]
    hz: u32,
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    let bus = linux::spi(&args.spi, args.cs, args.hz).map_err(|e| e.to_string())?;
    let mut sd = SD::new(bus, Delay);
    let card = sd.initialize().map_err(|e| format!("{:?}", e))?;
    println!("Card: {:?}", card);

    let mut buffer = [0u8; BLOCK_SIZE];
    sd.read_block(args.sector, &mut buffer).map_err(|e| format!("{:?}", e))?;
    println!("{}", pretty_hex(&buffer));
    if args.sector > 0 {
        return Ok(());
    }
    let mbr = MasterBootRecord::from_bytes(&buffer).map_err(|e| format!("{:?}", e))?;
    for partition in mbr.partition_table_entries().iter() {
        println!("{:?}", partition);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    match run() {
        Ok(_) => (),
        Err(e) => log::error!("{}", e),
    };
}
