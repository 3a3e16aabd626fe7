use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

pub const MANIFEST_FIELDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePair {
    pub key_frame: PathBuf,
    pub current_frame: PathBuf,
    pub aux: PathBuf,
}

impl FramePair {
    /// Parse one manifest line and resolve its paths against `data_root`.
    /// `line_number` is 1-based and only used for error reporting.
    pub fn parse_line(line: &str, line_number: usize, data_root: &Path) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [key, current, aux] = fields.as_slice() else {
            return Err(PipelineError::ManifestFormat {
                line: line_number,
                found: fields.len(),
                content: line.to_string(),
            });
        };

        Ok(Self {
            key_frame: data_root.join(key),
            current_frame: data_root.join(current),
            aux: data_root.join(aux),
        })
    }

    /// File name of the key frame, used to name the artifacts of this pair.
    pub fn identifier(&self) -> String {
        self.key_frame
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    ReadingManifest,
    Exhausted,
}

/// Yields exactly `steps` frame pairs, then stops without reading further.
///
/// A manifest shorter than `steps` is an error, as is any malformed line.
/// After the first error the walker is exhausted.
pub struct ManifestWalker<R> {
    reader: R,
    data_root: PathBuf,
    steps: usize,
    consumed: usize,
    line_number: usize,
    state: WalkState,
    buf: String,
}

impl<R: BufRead> ManifestWalker<R> {
    pub fn new(reader: R, data_root: impl Into<PathBuf>, steps: usize) -> Self {
        Self {
            reader,
            data_root: data_root.into(),
            steps,
            consumed: 0,
            line_number: 0,
            state: if steps == 0 {
                WalkState::Exhausted
            } else {
                WalkState::ReadingManifest
            },
            buf: String::new(),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == WalkState::Exhausted
    }

    fn read_pair(&mut self) -> Result<FramePair> {
        self.buf.clear();
        self.line_number += 1;
        let read = self
            .reader
            .read_line(&mut self.buf)
            .map_err(|source| PipelineError::ManifestRead {
                line: self.line_number,
                source,
            })?;
        if read == 0 {
            return Err(PipelineError::ManifestExhausted {
                line: self.line_number,
            });
        }
        let line = self.buf.trim_end_matches(['\n', '\r']);
        FramePair::parse_line(line, self.line_number, &self.data_root)
    }
}

impl<R: BufRead> Iterator for ManifestWalker<R> {
    type Item = Result<FramePair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == WalkState::Exhausted {
            return None;
        }

        let item = self.read_pair();
        match &item {
            Ok(_) => {
                self.consumed += 1;
                if self.consumed >= self.steps {
                    self.state = WalkState::Exhausted;
                }
            }
            Err(_) => self.state = WalkState::Exhausted,
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.steps.saturating_sub(self.consumed);
        match self.state {
            WalkState::ReadingManifest => (0, Some(remaining)),
            WalkState::Exhausted => (0, Some(0)),
        }
    }
}
