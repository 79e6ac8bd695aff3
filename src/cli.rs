use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Firmware image or other binary blob to unpack
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory; each run gets its own subdirectory
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long, default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Time limit for a single external tool, in seconds (overrides config)
    #[arg(long)]
    pub tool_timeout_secs: Option<u64>,

    /// Limit unpacking to these formats (comma-separated list)
    #[arg(long, value_delimiter = ',')]
    pub formats: Option<Vec<String>>,

    /// Option environment override, KEY=VALUE (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Address space limit for this process and its tools, in MiB
    #[arg(long)]
    pub max_memory_mib: Option<u64>,

    /// Open file descriptor limit
    #[arg(long)]
    pub max_open_files: Option<u64>,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}

#[cfg(test)]
mod tests {
    use super::CliOptions;
    use clap::Parser;

    #[test]
    fn parses_formats_list() {
        let opts = CliOptions::try_parse_from([
            "firmcarve",
            "--input",
            "fw.bin",
            "--formats",
            "squashfs,gzip,tar",
        ])
        .expect("parse");
        let formats = opts.formats.expect("formats");
        assert_eq!(formats, vec!["squashfs", "gzip", "tar"]);
    }

    #[test]
    fn collects_repeated_overrides() {
        let opts = CliOptions::try_parse_from([
            "firmcarve",
            "-i",
            "fw.bin",
            "--set",
            "TEMPLATE=%s.unpacked",
            "--set",
            "LZMA_TRY_ALL=1",
        ])
        .expect("parse");
        assert_eq!(opts.set, vec!["TEMPLATE=%s.unpacked", "LZMA_TRY_ALL=1"]);
        assert_eq!(opts.output, std::path::PathBuf::from("./output"));
    }

    #[test]
    fn parses_limits_and_timeout() {
        let opts = CliOptions::try_parse_from([
            "firmcarve",
            "--input",
            "fw.bin",
            "--tool-timeout-secs",
            "30",
            "--max-memory-mib",
            "2048",
            "--workers",
            "2",
        ])
        .expect("parse");
        assert_eq!(opts.tool_timeout_secs, Some(30));
        assert_eq!(opts.max_memory_mib, Some(2048));
        assert_eq!(opts.max_open_files, None);
        assert_eq!(opts.workers, 2);
    }

    #[test]
    fn input_is_required() {
        assert!(CliOptions::try_parse_from(["firmcarve"]).is_err());
    }
}
