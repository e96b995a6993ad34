use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;

/// Bundles finalized output files into `{stem}.zip` and removes the loose
/// originals. Must only run once every file has been closed.
pub fn zip_outputs(files: &[PathBuf], dir: &Path, stem: &str) -> Result<PathBuf> {
    let archive_path = dir.join(format!("{stem}.zip"));
    let mut zip = ZipWriter::new(File::create(&archive_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        zip.start_file(name, options)?;
        let mut contents = Vec::new();
        File::open(path)?.read_to_end(&mut contents)?;
        zip.write_all(&contents)?;
    }
    zip.finish()?;

    for path in files {
        fs::remove_file(path)?;
    }
    info!(path = %archive_path.display(), files = files.len(), "archived output files");
    Ok(archive_path)
}
