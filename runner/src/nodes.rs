use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    ops::Deref,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read node list {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// opaque host identifier as written in the node list
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Node(String);

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Deref for Node {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// load a newline delimited node list, keeping the order of the file
#[instrument(level = "debug")]
pub fn load_nodes(path: &Path) -> Result<Vec<Node>, InputError> {
    let file = File::open(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_nodes(BufReader::new(file)).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// trim every line and skip the ones that end up empty
pub fn parse_nodes<R: BufRead>(reader: R) -> Result<Vec<Node>, std::io::Error> {
    let mut nodes = Vec::new();
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line?;
        let name = line.trim();

        if name.is_empty() {
            skipped += 1;
        } else {
            nodes.push(Node::new(name));
        }
    }

    if skipped > 0 {
        debug!(skipped, "Skipped blank lines in node list");
    }

    Ok(nodes)
}
