use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use curl::easy::Easy;
use tracing::{info, warn};

use crate::configs::{ArchiveSpec, DownloadConfig};
use crate::{Error, Result};

/// Fetches and unpacks every archive of `config` relative to `base_dir`.
pub fn download_extract(base_dir: &Path, config: &DownloadConfig) -> Result<()> {
    if !base_dir.exists() {
        fs::create_dir_all(base_dir)?;
    }
    for spec in &config.archives {
        fetch_archive(base_dir, spec)?;
    }
    Ok(())
}

pub fn fetch_archive(base_dir: &Path, spec: &ArchiveSpec) -> Result<()> {
    let file_path = base_dir.join(&spec.archive);
    let folder = base_dir.join(&spec.folder);
    download(&spec.url, &file_path)?;
    fs::create_dir_all(&folder)?;
    info!("Unzipping to {} ... ", folder.display());
    extract(&file_path, &folder)?;
    if spec.remove_archive {
        remove_archive(&file_path)?;
    }
    Ok(())
}

fn download(url: &str, file_path: &Path) -> Result<()> {
    if file_path.exists() {
        info!("File {} already exists, skipping downloading.", file_path.display());
        return Ok(());
    }
    info!("Downloading {} to {} ... ", url, file_path.display());
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let download_err = |e: curl::Error| Error::Download {
        url: url.to_string(),
        reason: e.to_string(),
    };
    let mut easy = Easy::new();
    easy.url(url).map_err(download_err)?;
    easy.follow_location(true).map_err(download_err)?;
    easy.fail_on_error(true).map_err(download_err)?;
    let mut file = BufWriter::new(File::create(file_path)?);
    let performed = {
        let mut transfer = easy.transfer();
        transfer
            .write_function(|data| {
                // a short write makes curl abort the transfer
                Ok(file.write_all(data).map_or(0, |_| data.len()))
            })
            .map_err(download_err)?;
        transfer.perform()
    };
    if let Err(e) = performed.map_err(download_err).and_then(|_| Ok(file.flush()?)) {
        // leave no partial archive behind that a rerun would take as complete
        drop(file);
        let _ = fs::remove_file(file_path);
        return Err(e);
    }
    Ok(())
}

/// Unpacks a `.zip` into `folder`, or a `.gz` into `folder/<name without .gz>`.
pub fn extract(archive: &Path, folder: &Path) -> Result<()> {
    let ext = archive.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let reader = BufReader::new(File::open(archive)?);
    match ext {
        "zip" => {
            let mut zip = zip::ZipArchive::new(reader)?;
            zip.extract(folder)?;
            info!("extracted {} files from {}", zip.len(), archive.display());
        }
        "gz" => {
            let name = archive
                .file_stem()
                .ok_or_else(|| Error::invalid("archive", archive.display(), "no file name"))?;
            let out = folder.join(name);
            if out.exists() {
                info!("Extracted file {} already exists, skipping extraction.", out.display());
                return Ok(());
            }
            let mut gz = flate2::bufread::GzDecoder::new(reader);
            let mut file_out = BufWriter::new(File::create(&out)?);
            io::copy(&mut gz, &mut file_out)?;
            file_out.flush()?;
        }
        _ => {
            return Err(Error::invalid(
                "archive",
                archive.display(),
                "only .zip and .gz archives are supported",
            ))
        }
    }
    Ok(())
}

/// Removes the archive, an archive that is already gone is fine.
pub fn remove_archive(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{} was already removed", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use zip::write::FileOptions;

    fn write_zip(path: &Path) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        zip.start_file("weights/model.txt", FileOptions::default()).unwrap();
        zip.write_all(b"weights").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn existing_zip_is_extracted_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(&dir.path().join("w.zip"));
        let spec = ArchiveSpec {
            url: "http://localhost/never/fetched/w.zip".into(),
            archive: "w.zip".into(),
            folder: "./retinanet/scratch".into(),
            remove_archive: true,
        };
        let config = DownloadConfig { archives: vec![spec] };
        download_extract(dir.path(), &config).unwrap();
        let extracted = dir.path().join("retinanet/scratch/weights/model.txt");
        assert_eq!(fs::read_to_string(extracted).unwrap(), "weights");
        assert!(!dir.path().join("w.zip").exists());
    }

    #[test]
    fn gz_is_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt.gz");
        let mut enc = flate2::write::GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        enc.write_all(b"marsh,dev,other").unwrap();
        enc.finish().unwrap();
        extract(&path, dir.path()).unwrap();
        let mut s = String::new();
        File::open(dir.path().join("labels.txt")).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "marsh,dev,other");
    }

    #[test]
    fn failed_download_names_the_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.zip");
        let url = "unsupported://localhost/w.zip";
        match download(url, &path) {
            Err(Error::Download { url: failed, .. }) => assert_eq!(failed, url),
            other => panic!("expected a download error, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn missing_archive_removal_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        remove_archive(&dir.path().join("gone.zip")).unwrap();
        assert!(extract(&dir.path().join("x.tar"), dir.path()).is_err());
    }
}
