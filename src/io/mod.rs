use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::Itertools;
use log::trace;

use tagforge_cache::tag::source::TagSource;
use tagforge_cache::tag::TagClass;

/// Loads tag files from one or more tags directories, ordered by
/// precedence: the first directory containing a tag wins.
pub struct FolderTagSource {
    directories: Vec<PathBuf>,
}

impl FolderTagSource {
    pub fn new<P: AsRef<Path>>(directories: &[P]) -> FolderTagSource {
        FolderTagSource {
            directories: directories.iter().map(|d| d.as_ref().to_owned()).collect_vec(),
        }
    }

    fn file_for(&self, directory: &Path, path: &str, class: TagClass) -> PathBuf {
        let mut file = directory.to_owned();
        for component in path.split('/') {
            file.push(component);
        }
        file.set_extension(class.extension());
        file
    }
}

impl TagSource for FolderTagSource {
    fn load(&mut self, path: &str, class: TagClass) -> io::Result<Option<Vec<u8>>> {
        for directory in &self.directories {
            let file = self.file_for(directory, path, class);
            match fs::read(&file) {
                Ok(bytes) => {
                    trace!("loaded {} from {}", path, file.display());
                    return Ok(Some(bytes));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn probe_class(&self, path: &str) -> Option<TagClass> {
        for directory in &self.directories {
            for class in TagClass::ALL {
                if self.file_for(directory, path, class).is_file() {
                    return Some(class);
                }
            }
        }
        None
    }
}

/// Parse a plain-text reference index: one `path.class` line per tag, in
/// index order. Empty lines end the list.
pub fn read_index_file(path: &str) -> anyhow::Result<Vec<(TagClass, String)>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read index {}", path))?;
    let mut index = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let (tag_path, extension) = line
            .rsplit_once('.')
            .with_context(|| format!("index line \"{}\" is missing an extension", line))?;
        let class = TagClass::from_extension(extension)
            .with_context(|| format!("index line \"{}\" has an unknown class", line))?;
        index.push((class, tag_path.to_ascii_lowercase()));
    }
    Ok(index)
}
