//! Per-study dense vectors in a companion file next to the store.
//!
//! Layout (little-endian): magic `SRKE`, format version, quantization
//! flag, u32 dimension, u64 record count, then per record a
//! length-prefixed accession followed by the vector (f32s, or i8s plus a
//! f32 scale when quantized). The layout is an implementation detail, not
//! an interchange format.

use crate::error::SrakeError;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const MAGIC: &[u8; 4] = b"SRKE";
const VERSION: u8 = 1;
/// Offset of the record-count field, patched on finish.
const COUNT_OFFSET: u64 = 10;

/// In-memory vector index with cosine scoring.
pub struct VectorIndex {
    dimensions: usize,
    accessions: Vec<String>,
    /// Row-major vectors, L2 norms precomputed.
    vectors: Vec<Vec<f32>>,
    norms: Vec<f32>,
    by_accession: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn open(path: &Path) -> crate::Result<Self> {
        let file = File::open(path).map_err(|_| {
            SrakeError::NotFound(format!("vector index at {}", path.display()))
        })?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SrakeError::Index("bad vector file magic".into()));
        }
        let version = read_u8(&mut reader)?;
        if version != VERSION {
            return Err(SrakeError::Index(format!(
                "unsupported vector file version {version}"
            )));
        }
        let quantized = read_u8(&mut reader)? != 0;
        let dimensions = read_u32(&mut reader)? as usize;
        let count = read_u64(&mut reader)? as usize;

        let mut accessions = Vec::with_capacity(count);
        let mut vectors = Vec::with_capacity(count);
        let mut by_accession = HashMap::with_capacity(count);

        for i in 0..count {
            let len = read_u16(&mut reader)? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            let accession = String::from_utf8(buf)
                .map_err(|_| SrakeError::Index("non-UTF8 accession in vector file".into()))?;

            let vector = if quantized {
                let mut scale_buf = [0u8; 4];
                reader.read_exact(&mut scale_buf)?;
                let scale = f32::from_le_bytes(scale_buf);
                let mut raw = vec![0u8; dimensions];
                reader.read_exact(&mut raw)?;
                raw.iter().map(|b| (*b as i8) as f32 * scale).collect()
            } else {
                let mut raw = vec![0u8; dimensions * 4];
                reader.read_exact(&mut raw)?;
                raw.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<f32>>()
            };

            by_accession.insert(accession.clone(), i);
            accessions.push(accession);
            vectors.push(vector);
        }

        let norms = vectors.iter().map(|v| l2_norm(v)).collect();
        info!(path = %path.display(), count, dimensions, quantized, "vector index loaded");
        Ok(Self {
            dimensions,
            accessions,
            vectors,
            norms,
            by_accession,
        })
    }

    pub fn len(&self) -> usize {
        self.accessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessions.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn vector_for(&self, accession: &str) -> Option<&[f32]> {
        self.by_accession
            .get(accession)
            .map(|&i| self.vectors[i].as_slice())
    }

    /// Top-k by cosine similarity, optionally restricted to a candidate
    /// set (the hybrid path hands in the lexical result set).
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        candidates: Option<&HashSet<String>>,
    ) -> Vec<(String, f32)> {
        let query_norm = l2_norm(query);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                candidates.is_none_or(|set| set.contains(self.accessions[*i].as_str()))
            })
            .map(|(i, v)| {
                let denom = self.norms[i] * query_norm;
                let cos = if denom == 0.0 { 0.0 } else { dot(query, v) / denom };
                (i, cos)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(top_k)
            .map(|(i, cos)| (self.accessions[i].clone(), cos))
            .collect()
    }

    /// Cosine similarity between two stored entries.
    pub fn similarity(&self, a: &str, b: &str) -> Option<f32> {
        let &ia = self.by_accession.get(a)?;
        let &ib = self.by_accession.get(b)?;
        let denom = self.norms[ia] * self.norms[ib];
        if denom == 0.0 {
            return Some(0.0);
        }
        Some(dot(&self.vectors[ia], &self.vectors[ib]) / denom)
    }
}

/// Streaming writer; records are appended and the header count is patched
/// on finish.
pub struct VectorWriter {
    file: BufWriter<File>,
    path: PathBuf,
    dimensions: usize,
    quantize: bool,
    count: u64,
}

impl VectorWriter {
    pub fn create(path: &Path, dimensions: usize, quantize: bool) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION, quantize as u8])?;
        file.write_all(&(dimensions as u32).to_le_bytes())?;
        file.write_all(&0u64.to_le_bytes())?; // count, patched later
        Ok(Self {
            file,
            path: path.to_path_buf(),
            dimensions,
            quantize,
            count: 0,
        })
    }

    pub fn push(&mut self, accession: &str, vector: &[f32]) -> crate::Result<()> {
        if vector.len() != self.dimensions {
            return Err(SrakeError::Index(format!(
                "vector for {accession} has {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )));
        }
        let accession_bytes = accession.as_bytes();
        self.file
            .write_all(&(accession_bytes.len() as u16).to_le_bytes())?;
        self.file.write_all(accession_bytes)?;

        if self.quantize {
            let max_abs = vector.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 127.0 };
            self.file.write_all(&scale.to_le_bytes())?;
            let quantized: Vec<u8> = vector
                .iter()
                .map(|v| ((v / scale).round().clamp(-127.0, 127.0) as i8) as u8)
                .collect();
            self.file.write_all(&quantized)?;
        } else {
            for v in vector {
                self.file.write_all(&v.to_le_bytes())?;
            }
        }
        self.count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> crate::Result<u64> {
        self.file.flush()?;
        let mut file = self.file.into_inner().map_err(|e| {
            SrakeError::Io(std::io::Error::other(format!(
                "flushing {}: {e}",
                self.path.display()
            )))
        })?;
        file.seek(SeekFrom::Start(COUNT_OFFSET))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.count)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_index(path: &Path, quantize: bool) {
        let mut writer = VectorWriter::create(path, 4, quantize).unwrap();
        writer.push("SRP000001", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        writer.push("SRP000002", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        writer.push("SRP000003", &[0.7, 0.7, 0.0, 0.0]).unwrap();
        assert_eq!(writer.finish().unwrap(), 3);
    }

    #[test]
    fn test_round_trip_and_cosine_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srake.embeddings");
        write_index(&path, false);

        let index = VectorIndex::open(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.dimensions(), 4);

        let results = index.search(&[1.0, 0.1, 0.0, 0.0], 3, None);
        assert_eq!(results[0].0, "SRP000001");
        assert!(results[0].1 > 0.9);
        assert_eq!(results[1].0, "SRP000003");
        assert_eq!(results[2].0, "SRP000002");
    }

    #[test]
    fn test_candidate_restriction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srake.embeddings");
        write_index(&path, false);
        let index = VectorIndex::open(&path).unwrap();

        let candidates: HashSet<String> = ["SRP000002".to_string()].into();
        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 10, Some(&candidates));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "SRP000002");
    }

    #[test]
    fn test_quantized_round_trip_close_enough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srake.embeddings");
        write_index(&path, true);
        let index = VectorIndex::open(&path).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 1, None);
        assert_eq!(results[0].0, "SRP000001");
        assert!((results[0].1 - 1.0).abs() < 0.02, "int8 loss should stay small");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        match VectorIndex::open(&dir.path().join("absent.embeddings")) {
            Err(SrakeError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|i| i.len())),
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = VectorWriter::create(&dir.path().join("v"), 4, false).unwrap();
        assert!(writer.push("SRP000001", &[1.0, 2.0]).is_err());
    }
}
