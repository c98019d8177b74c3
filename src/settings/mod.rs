use clap::{Parser, Subcommand};

use tagforge_cache::Engine;

#[derive(Parser, Debug)]
#[command(name = "tagforge")]
#[command(version)]
#[command(about = "Compile tag graphs into cache files and inspect them")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a cache file from a scenario and everything it references.
    Build {
        /// Logical path of the scenario tag (without extension).
        scenario: String,

        /// Target engine: retail, custom, demo, console or anniversary.
        #[arg(short = 'g', long, value_parser = parse_engine)]
        engine: Engine,

        /// Tags directories, ordered by precedence. Use multiple times to
        /// add more directories.
        #[arg(short, long, default_value = "tags", env = "TAGFORGE_TAGS_DIR")]
        tags: Vec<String>,

        /// Maps directory the output lands in when --output is not given.
        #[arg(short, long, default_value = "maps", env = "TAGFORGE_MAPS_DIR")]
        maps: String,

        /// Output to a specific file.
        #[arg(short, long)]
        output: Option<String>,

        /// Forge the CRC32 of the built file (1-8 hex digits).
        #[arg(long, value_parser = parse_crc)]
        forge_crc: Option<u32>,

        /// Compress the cache file body.
        #[arg(short, long)]
        compress: bool,

        /// Do not compress the cache file body.
        #[arg(short, long, conflicts_with = "compress")]
        uncompressed: bool,

        /// Reference index file for stock tag reuse.
        #[arg(short = 'w', long)]
        with_index: Option<String>,

        /// Require every indexable tag to resolve through the index.
        #[arg(short, long, requires = "with_index")]
        always_index_tags: bool,

        /// Record a different scenario name in the header.
        #[arg(short = 'N', long)]
        rename_scenario: Option<String>,

        /// Deduplicate identical structs. Slower builds, smaller files.
        #[arg(short = 'O', long)]
        optimize: bool,

        /// Skip graph-traversal postprocessing hooks.
        #[arg(long)]
        no_recursion: bool,
    },
    /// Inspect a built cache file.
    Info {
        /// The cache file to load.
        map: String,

        /// Split bitmap resource file.
        #[arg(long)]
        bitmaps: Option<String>,

        /// Split localization resource file.
        #[arg(long)]
        loc: Option<String>,

        /// Split sound resource file.
        #[arg(long)]
        sounds: Option<String>,

        /// Do not enforce the header checksum.
        #[arg(long)]
        skip_checksum: bool,
    },
}

fn parse_engine(value: &str) -> Result<Engine, String> {
    Engine::from_name(value).ok_or_else(|| {
        format!(
            "unknown engine {}; valid engines are retail, custom, demo, console, anniversary",
            value
        )
    })
}

fn parse_crc(value: &str) -> Result<u32, String> {
    if value.is_empty() || value.len() > 8 {
        return Err(format!("invalid CRC32 {} (must be 1-8 digits)", value));
    }
    u32::from_str_radix(value, 16)
        .map_err(|_| format!("invalid CRC32 {} (must be hexadecimal)", value))
}
