use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_ksort::config::{line_block_size, DEFAULT_BLOCK_SIZE};
use ext_ksort::{AllocPolicy, ExtVector, KSorter, KSorterBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let alloc: Alloc = arg_parser.value_of_t_or_exit("alloc");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let memory = arg_parser.value_of("memory").expect("value has default");
    let block_raw_size = arg_parser.value_of("block_raw_size").expect("value has default");
    let block_size: Option<usize> = arg_parser
        .is_present("block_size")
        .then(|| arg_parser.value_of_t_or_exit("block_size"));
    let disks: usize = arg_parser.value_of_t_or_exit("disks");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = arg_parser.value_of("input").expect("value is required");
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let block_raw_size = block_raw_size.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize;
    let max_line_len = match max_line_len(input) {
        Ok(max_line_len) => max_line_len,
        Err(err) => {
            log::error!("input file scanning error: {}", err);
            process::exit(1);
        }
    };
    let fitting_block_size = line_block_size(block_raw_size, max_line_len);
    let block_size = match block_size {
        Some(block_size) => {
            if block_size > fitting_block_size {
                log::warn!(
                    "blocks of {} records may not fit into {} bytes, lines of up to {} bytes allow {} records",
                    block_size,
                    block_raw_size,
                    max_line_len,
                    fitting_block_size
                );
            }
            block_size
        }
        None => fitting_block_size.min(DEFAULT_BLOCK_SIZE),
    };
    log::info!("block size: {} records ({} bytes on disk)", block_size, block_raw_size);

    let mut sorter_builder = KSorterBuilder::new()
        .with_memory(memory.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize)
        .with_block_size(block_size)
        .with_block_raw_size(block_raw_size)
        .with_disks_number(disks)
        .with_alloc_policy(alloc.into());

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter: KSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let mut vector: ExtVector<(u64, String)> = ExtVector::new(&sorter);
    for (lineno, line) in input_stream.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("input reading error: {}", err);
                process::exit(1);
            }
        };
        let key = match parse_key(&line) {
            Some(key) => key,
            None => {
                log::error!("line {}: no unsigned integer key found", lineno + 1);
                process::exit(1);
            }
        };
        if let Err(err) = vector.push((key, line)) {
            log::error!("data loading error: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = sorter.sort(&mut vector) {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }

    let sorted_stream = match vector.iter() {
        Ok(sorted_stream) => sorted_stream,
        Err(err) => {
            log::error!("sorted data reading error: {}", err);
            process::exit(1);
        }
    };

    for record in sorted_stream {
        let (_, line) = match record {
            Ok(record) => record,
            Err(err) => {
                log::error!("sorting stream error: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = output_stream.write_all(format!("{}\n", line).as_bytes()) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        };
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
}

/// Returns the length in bytes of the longest line of a file.
fn max_line_len(path: &str) -> io::Result<usize> {
    let mut reader = io::BufReader::new(fs::File::open(path)?);
    let mut line = Vec::new();
    let mut max_len = 0;

    while reader.read_until(b'\n', &mut line)? > 0 {
        max_len = max_len.max(line.len());
        line.clear();
    }

    return Ok(max_len);
}

/// Parses the leading unsigned integer of a line.
fn parse_key(line: &str) -> Option<u64> {
    line.split_whitespace().next()?.parse().ok()
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Alloc {
    Striping,
    SimpleRandom,
    FullyRandom,
    RandomCyclic,
}

impl Alloc {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Alloc::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Alloc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Alloc as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Alloc> for AllocPolicy {
    fn from(alloc: Alloc) -> Self {
        match alloc {
            Alloc::Striping => AllocPolicy::Striping,
            Alloc::SimpleRandom => AllocPolicy::SimpleRandom,
            Alloc::FullyRandom => AllocPolicy::FullyRandom,
            Alloc::RandomCyclic => AllocPolicy::RandomCyclic,
        }
    }
}

fn validate_byte_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-ksort")
        .about("external stable key sorter: sorts lines by their leading unsigned integer key")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("internal memory budget")
                .takes_value(true)
                .default_value("64MiB")
                .validator(validate_byte_size),
        )
        .arg(
            clap::Arg::new("block_size")
                .short('b')
                .long("block-size")
                .help("block size in records, by default the largest size whose blocks fit the longest input line")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("block_raw_size")
                .short('r')
                .long("block-raw-size")
                .help("block size on disk")
                .takes_value(true)
                .default_value("1MiB")
                .validator(validate_byte_size),
        )
        .arg(
            clap::Arg::new("disks")
                .short('n')
                .long("disks")
                .help("number of disk files")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            clap::Arg::new("alloc")
                .short('a')
                .long("alloc")
                .help("disk block allocation policy")
                .takes_value(true)
                .default_value("random-cyclic")
                .possible_values(Alloc::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
