use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use itertools::Itertools;

use tagforge_cache::build::{BuildParameters, BuildWorkload};
use tagforge_cache::map::{LoadOptions, Map};
use tagforge_cache::script::NodeTableCompiler;
use tagforge_cache::tag::schema::BuiltinSchemas;

use crate::io::{read_index_file, FolderTagSource};
use crate::settings::{CliArgs, Command};

mod io;
mod settings;

fn main() -> ExitCode {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("starting with args: {:?}", args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    match args.command {
        Command::Build {
            scenario,
            engine,
            tags,
            maps,
            output,
            forge_crc,
            compress,
            uncompressed,
            with_index,
            always_index_tags,
            rename_scenario,
            optimize,
            no_recursion,
        } => {
            let mut params = BuildParameters::new(engine);
            params.forged_crc = forge_crc;
            if compress {
                params.compress = true;
            } else if uncompressed {
                params.compress = false;
            }
            params.optimize_space = optimize;
            params.disable_recursion = no_recursion;
            params.rename_scenario = rename_scenario.clone();
            params.always_index = always_index_tags;
            params.index = with_index.as_deref().map(read_index_file).transpose()?;

            let mut source = FolderTagSource::new(&tags);
            let schemas = BuiltinSchemas::new();
            let script_compiler = NodeTableCompiler::new();

            let map = BuildWorkload::compile_map(
                &scenario,
                &mut source,
                &schemas,
                &script_compiler,
                &params,
            )
            .with_context(|| format!("failed to compile {}", scenario))?;

            let map_name = rename_scenario
                .unwrap_or_else(|| scenario.rsplit('/').next().unwrap_or(&scenario).to_owned());
            let final_file = match output {
                Some(output) => PathBuf::from(output),
                None => Path::new(&maps).join(format!("{}.map", map_name)),
            };
            fs::write(&final_file, &map)
                .with_context(|| format!("failed to write {}", final_file.display()))?;
            println!(
                "built {} ({} bytes, {})",
                final_file.display(),
                map.len(),
                engine
            );
            Ok(())
        }
        Command::Info {
            map,
            bitmaps,
            loc,
            sounds,
            skip_checksum,
        } => {
            let data = fs::read(&map).with_context(|| format!("failed to read {}", map))?;
            let bitmap_data = read_optional(bitmaps.as_deref())?;
            let loc_data = read_optional(loc.as_deref())?;
            let sound_data = read_optional(sounds.as_deref())?;

            let options = LoadOptions {
                verify_checksum: !skip_checksum,
            };
            let loaded = Map::load(data, bitmap_data, loc_data, sound_data, &options)
                .with_context(|| format!("failed to load {}", map))?;

            print_info(&loaded);
            Ok(())
        }
    }
}

fn read_optional(path: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => fs::read(path).with_context(|| format!("failed to read {}", path)),
        None => Ok(Vec::new()),
    }
}

fn print_info(map: &Map) {
    let header = map.header();
    println!("scenario   {}", header.scenario_name);
    println!("engine     {}", map.engine());
    println!("size       {} bytes", header.file_length);
    println!(
        "tag data   {} bytes at {}",
        header.tag_data_length, header.tag_data_offset
    );
    println!("base       {:#010x}", header.base_memory_address);
    println!("crc32      {:#010x}", header.checksum);
    println!("compressed {}", if map.is_compressed() { "yes" } else { "no" });
    println!("protected  {}", if map.is_protected() { "likely" } else { "no" });
    println!("tags       {}", map.tag_count());

    let by_class = map
        .tags()
        .iter()
        .map(|t| t.class)
        .counts()
        .into_iter()
        .sorted_by_key(|&(class, _)| class.extension())
        .collect_vec();
    for (class, count) in by_class {
        println!("  {:<20} {}", class.extension(), count);
    }

    for tag in map.tags() {
        let location = match (tag.data_offset, tag.indexed_id) {
            (Some(offset), _) => format!("{:#010x}", offset),
            (None, Some(stock)) => format!("stock #{}", stock),
            (None, None) => "-".to_owned(),
        };
        println!("{:<48} {:<16} {}", tag.path, tag.class.extension(), location);
    }
}
