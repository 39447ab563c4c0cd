//! Measurement directories on disk.
//!
//! Each acquisition session writes into its own directory named
//! `YYYYMMDD_HHMMSS_<suffix>`. Every measurement [`Node`] becomes one JSON file,
//! numbered in the order it was written (`0000_sweep_array.json`, ...), and closing the
//! directory writes `manifest.json` with the session [`Metadata`] and the node list.

pub mod csv_writer;
pub mod temperature;

pub use csv_writer::write_records_csv;
pub use temperature::TemperatureLog;

use crate::error::{ReadoutError, ReadoutResult};
use crate::measurement::{Node, Origin};
use crate::metadata::Metadata;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata: Metadata,
    pub nodes: Vec<String>,
}

/// A directory being written by an acquisition session.
#[derive(Debug)]
pub struct DataDirectory {
    path: PathBuf,
    metadata: Metadata,
    nodes: Vec<String>,
}

fn check_suffix(suffix: &str) -> ReadoutResult<()> {
    if suffix.contains(['/', '\\']) {
        return Err(ReadoutError::InvalidArgument(format!(
            "directory suffix '{}' cannot contain a path separator",
            suffix
        )));
    }
    Ok(())
}

impl DataDirectory {
    /// Create `<base>/<timestamp>_<suffix>`. A directory created within the same second
    /// with the same suffix gets a numeric tail.
    pub fn create(base: impl AsRef<Path>, suffix: &str, metadata: Metadata) -> ReadoutResult<Self> {
        check_suffix(suffix)?;
        metadata.validate()?;
        let base = base.as_ref();
        fs::create_dir_all(base)?;
        let stem = match suffix {
            "" => Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            _ => format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), suffix),
        };
        let mut path = base.join(&stem);
        let mut attempt = 1;
        loop {
            match fs::create_dir(&path) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    attempt += 1;
                    path = base.join(format!("{}_{}", stem, attempt));
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(path = %path.display(), "data directory created");
        Ok(Self {
            path,
            metadata,
            nodes: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Validate and write one node. Returns the file it was written to.
    pub fn write(&mut self, node: &Node) -> ReadoutResult<PathBuf> {
        node.validate()?;
        let name = format!("{:04}_{}.json", self.nodes.len(), node.kind());
        let path = self.path.join(&name);
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, node)?;
        writer.flush()?;
        debug!(node = %name, description = node.description(), "node written");
        self.nodes.push(name);
        Ok(path)
    }

    /// Finish the session metadata and write the manifest.
    pub fn close(mut self) -> ReadoutResult<PathBuf> {
        self.metadata.finish();
        let manifest = Manifest {
            metadata: self.metadata,
            nodes: self.nodes,
        };
        let text = serde_json::to_string_pretty(&manifest)?;
        fs::write(self.path.join(MANIFEST_FILE), text)?;
        info!(path = %self.path.display(), nodes = manifest.nodes.len(), "data directory closed");
        Ok(self.path)
    }
}

/// A directory opened for reading.
#[derive(Debug, Clone)]
pub struct StoredDirectory {
    pub path: PathBuf,
    /// Absent when the writing session never closed the directory.
    pub manifest: Option<Manifest>,
    nodes: Vec<String>,
}

fn is_node_file(name: &str) -> bool {
    name.ends_with(".json")
        && name != MANIFEST_FILE
        && name.len() > 5
        && name.as_bytes()[..4].iter().all(u8::is_ascii_digit)
}

impl StoredDirectory {
    pub fn open(path: impl AsRef<Path>) -> ReadoutResult<Self> {
        let path = path.as_ref().to_path_buf();
        let manifest_path = path.join(MANIFEST_FILE);
        let manifest: Option<Manifest> = if manifest_path.exists() {
            Some(serde_json::from_str(&fs::read_to_string(&manifest_path)?)?)
        } else {
            None
        };
        let nodes = match &manifest {
            Some(m) => m.nodes.clone(),
            None => {
                let mut names: Vec<String> = fs::read_dir(&path)?
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter(|name| is_node_file(name))
                    .collect();
                names.sort();
                names
            }
        };
        Ok(Self { path, manifest, nodes })
    }

    pub fn node_names(&self) -> &[String] {
        &self.nodes
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.manifest.as_ref().map(|m| &m.metadata)
    }

    /// Load one node, check its shapes, and record where it came from.
    pub fn read(&self, name: &str) -> ReadoutResult<Node> {
        if !self.nodes.iter().any(|n| n == name) {
            return Err(ReadoutError::InvalidArgument(format!(
                "{} has no node named {}",
                self.path.display(),
                name
            )));
        }
        let reader = BufReader::new(File::open(self.path.join(name))?);
        let mut node: Node = serde_json::from_reader(reader)?;
        node.validate()?;
        node.set_origin(Origin {
            path: self.path.clone(),
            node: name.to_string(),
        });
        Ok(node)
    }

    pub fn read_all(&self) -> ReadoutResult<Vec<Node>> {
        self.nodes.iter().map(|name| self.read(name)).collect()
    }
}

/// Every node in the directory at `path`, in the order written.
pub fn read_all(path: impl AsRef<Path>) -> ReadoutResult<Vec<Node>> {
    StoredDirectory::open(path)?.read_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{State, StreamArray, SweepArray};
    use crate::metadata::MetadataBuilder;
    use crate::readout::RoachState;
    use num_complex::Complex64;

    fn stream_array() -> StreamArray {
        StreamArray::new(
            vec![100, 200],
            vec![1.0, 1.0],
            vec![0.0, 0.5],
            vec![0, 1],
            vec![25, 50],
            vec![vec![Complex64::new(1.0, 2.0); 8], vec![Complex64::new(-1.0, 0.5); 8]],
            RoachState::default(),
        )
        .unwrap()
        .with_description("test stream")
    }

    #[test]
    fn test_inconsistent_node_on_disk_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        let mut dir = DataDirectory::create(base.path(), "bad", MetadataBuilder::new().procedure("test").build()).unwrap();
        let file = dir.write(&Node::from(stream_array())).unwrap();
        let path = dir.close().unwrap();

        let mut json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        json["tone_index"] = serde_json::json!([5, 1]);
        fs::write(&file, serde_json::to_string(&json).unwrap()).unwrap();

        let stored = StoredDirectory::open(&path).unwrap();
        let err = stored.read_all().unwrap_err();
        assert!(matches!(err, ReadoutError::Shape(_)), "got {}", err);
        assert!(read_all(&path).is_err());
    }

    #[test]
    fn test_write_close_and_read_back() {
        let base = tempfile::tempdir().unwrap();
        let metadata = MetadataBuilder::new().procedure("test").build();
        let mut dir = DataDirectory::create(base.path(), "unit", metadata).unwrap();
        let name = dir.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with("_unit"));
        assert_eq!(name.len(), "YYYYMMDD_HHMMSS_unit".len());

        let first = dir.write(&Node::from(stream_array())).unwrap();
        assert!(first.ends_with("0000_stream_array.json"));
        let sweep = SweepArray::new(vec![stream_array()], State::new().with("heater", 0.5), "sweep");
        dir.write(&Node::from(sweep)).unwrap();
        let path = dir.close().unwrap();

        let stored = StoredDirectory::open(&path).unwrap();
        assert_eq!(stored.node_names(), &["0000_stream_array.json", "0001_sweep_array.json"]);
        let metadata = stored.metadata().unwrap();
        assert_eq!(metadata.procedure, "test");
        assert!(metadata.finished.is_some());

        let nodes = stored.read_all().unwrap();
        assert_eq!(nodes[1].kind(), "sweep_array");
        let origin = nodes[0].origin().unwrap();
        assert_eq!(origin.node, "0000_stream_array.json");
        assert_eq!(origin.path, path);
        match &nodes[0] {
            Node::StreamArray(sa) => assert_eq!(sa.description, "test stream"),
            other => panic!("unexpected node {}", other.kind()),
        }
    }

    #[test]
    fn test_unclosed_directory_lists_node_files() {
        let base = tempfile::tempdir().unwrap();
        let mut dir = DataDirectory::create(base.path(), "open", Metadata::default()).unwrap();
        dir.write(&Node::from(stream_array())).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let nodes = read_all(dir.path()).unwrap();
        assert_eq!(nodes.len(), 1);
        let stored = StoredDirectory::open(dir.path()).unwrap();
        assert!(stored.manifest.is_none());
        assert!(stored.read("0005_scan.json").is_err());
    }

    #[test]
    fn test_same_second_gets_distinct_names() {
        let base = tempfile::tempdir().unwrap();
        let a = DataDirectory::create(base.path(), "x", Metadata::default()).unwrap();
        let b = DataDirectory::create(base.path(), "x", Metadata::default()).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(DataDirectory::create(base.path(), "a/b", Metadata::default()).is_err());
    }
}
