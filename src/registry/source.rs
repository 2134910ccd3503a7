use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, warn};
use zip::ZipArchive;

/// Where registry dumps are read from. Every JSON file holds a top-level array of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    File(PathBuf),
    Dir(PathBuf),
    Zip(PathBuf),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub files: usize,
    pub skipped: usize,
    pub records: usize,
}

fn is_json(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".json")
}

fn parse_records<R: Read>(reader: R) -> serde_json::Result<Vec<Value>> {
    serde_json::from_reader(BufReader::new(reader))
}

impl RegistrySource {
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Self::Dir(path.to_path_buf()));
        }
        if !path.is_file() {
            bail!("Registry source {:?} does not exist", path);
        }
        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if is_zip {
            Ok(Self::Zip(path.to_path_buf()))
        } else {
            Ok(Self::File(path.to_path_buf()))
        }
    }

    fn dir_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let dir_str = dir
            .to_str()
            .with_context(|| format!("Non UTF-8 path {:?}", dir))?;
        // Only the file part is a pattern; `[`, `*` and `?` in the directory are literal.
        let pattern = format!(
            "{}/*.json",
            glob::Pattern::escape(dir_str.trim_end_matches('/'))
        );
        let mut files = glob::glob(&pattern)?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to list {:?}", dir))?;
        files.sort();
        Ok(files)
    }

    fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("Failed to read zip archive {:?}", path))
    }

    /// Number of JSON files that `for_each_batch` will visit.
    pub fn file_count(&self) -> Result<usize> {
        match self {
            Self::File(_) => Ok(1),
            Self::Dir(dir) => Ok(Self::dir_files(dir)?.len()),
            Self::Zip(path) => {
                let archive = Self::open_zip(path)?;
                Ok(archive.file_names().filter(|n| is_json(n)).count())
            }
        }
    }

    /// Hand each file's records to `f`, one file at a time.
    ///
    /// A file that is not a JSON array is logged and skipped. Errors from `f` abort the walk.
    pub fn for_each_batch<F>(&self, mut f: F) -> Result<SourceStats>
    where
        F: FnMut(&str, Vec<Value>) -> Result<()>,
    {
        let mut stats = SourceStats::default();
        let mut handle = |name: &str, parsed: serde_json::Result<Vec<Value>>| -> Result<()> {
            stats.files += 1;
            match parsed {
                Ok(records) => {
                    debug!(file = name, records = records.len(), "read registry file");
                    stats.records += records.len();
                    f(name, records)
                }
                Err(e) => {
                    warn!(file = name, error = %e, "skipping unreadable registry file");
                    stats.skipped += 1;
                    Ok(())
                }
            }
        };

        match self {
            Self::File(path) => {
                let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
                handle(&path.display().to_string(), parse_records(file))?;
            }
            Self::Dir(dir) => {
                for path in Self::dir_files(dir)? {
                    let file =
                        File::open(&path).with_context(|| format!("Failed to open {:?}", path))?;
                    handle(&path.display().to_string(), parse_records(file))?;
                }
            }
            Self::Zip(path) => {
                let mut archive = Self::open_zip(path)?;
                for i in 0..archive.len() {
                    let entry = archive
                        .by_index(i)
                        .with_context(|| format!("Failed to read entry {} of {:?}", i, path))?;
                    if entry.is_dir() || !is_json(entry.name()) {
                        continue;
                    }
                    let name = entry.name().to_string();
                    handle(&name, parse_records(entry))?;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const FIXTURE: &str = "tests/fixtures/egrul_sample.json";

    fn collect(source: &RegistrySource) -> (Vec<String>, SourceStats) {
        let mut names = Vec::new();
        let stats = source
            .for_each_batch(|name, _records| {
                names.push(name.to_string());
                Ok(())
            })
            .unwrap();
        (names, stats)
    }

    #[test]
    fn single_file() {
        let source = RegistrySource::detect(Path::new(FIXTURE)).unwrap();
        assert!(matches!(source, RegistrySource::File(_)));
        let (names, stats) = collect(&source);
        assert_eq!(names.len(), 1);
        assert_eq!(stats.records, 7);
        assert_eq!(source.file_count().unwrap(), 1);
    }

    #[test]
    fn directory_in_name_order_skipping_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let sample = std::fs::read_to_string(FIXTURE).unwrap();
        std::fs::write(dir.path().join("b.json"), &sample).unwrap();
        std::fs::write(dir.path().join("a.json"), "[]").unwrap();
        std::fs::write(dir.path().join("c.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = RegistrySource::detect(dir.path()).unwrap();
        assert_eq!(source.file_count().unwrap(), 3);

        let (names, stats) = collect(&source);
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("a.json"));
        assert!(names[1].ends_with("b.json"));
        assert_eq!(stats, SourceStats { files: 3, skipped: 1, records: 7 });
    }

    #[test]
    fn directory_with_pattern_characters() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("dump[1]");
        std::fs::create_dir(&dir).unwrap();
        std::fs::copy(FIXTURE, dir.join("a.json")).unwrap();
        // Would match `dump[1]` itself if the brackets were read as a class.
        std::fs::create_dir(root.path().join("dump1")).unwrap();
        std::fs::write(root.path().join("dump1").join("b.json"), "[]").unwrap();

        let source = RegistrySource::detect(&dir).unwrap();
        assert_eq!(source.file_count().unwrap(), 1);
        let (names, stats) = collect(&source);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("a.json"));
        assert_eq!(stats.records, 7);
    }

    #[test]
    fn zip_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("egrul.json.zip");
        {
            let file = File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let opts = SimpleFileOptions::default();
            zip.add_directory("part/", opts).unwrap();
            zip.start_file("part/01.json", opts).unwrap();
            zip.write_all(std::fs::read(FIXTURE).unwrap().as_slice()).unwrap();
            zip.start_file("README", opts).unwrap();
            zip.write_all(b"not a dump").unwrap();
            zip.start_file("02.json", opts).unwrap();
            zip.write_all(b"[{\"ogrn\": \"1\"}]").unwrap();
            zip.finish().unwrap();
        }

        let source = RegistrySource::detect(&path).unwrap();
        assert!(matches!(source, RegistrySource::Zip(_)));
        assert_eq!(source.file_count().unwrap(), 2);

        let (names, stats) = collect(&source);
        assert_eq!(names, vec!["part/01.json", "02.json"]);
        assert_eq!(stats.records, 8);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn callback_errors_abort() {
        let source = RegistrySource::detect(Path::new(FIXTURE)).unwrap();
        let result = source.for_each_batch(|_, _| anyhow::bail!("disk full"));
        assert!(result.is_err());
    }

    #[test]
    fn missing_source() {
        assert!(RegistrySource::detect(Path::new("tests/fixtures/missing.zip")).is_err());
    }
}
